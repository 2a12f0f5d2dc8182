//! File-backed sinks and directory tree creation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use super::{Sink, SinkError};

/// A write-only file sink.
///
/// Creation truncates any existing file at the same path.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
    bytes_written: u64,
}

impl FileSink {
    /// Open a sink at `path`, truncating an existing file.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the file cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| SinkError::new(&path, source))?;
        Ok(Self {
            path,
            file,
            bytes_written: 0,
        })
    }

    /// The path this sink writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        self.file
            .write_all(bytes)
            .map_err(|source| SinkError::new(&self.path, source))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.file
            .flush()
            .map_err(|source| SinkError::new(&self.path, source))
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Creates the on-disk directory tree for one chunk group and opens its sinks.
///
/// The tree is `<base>/c<C>/y<Y>/x<X>` with the channel level outermost, then
/// y, then x; sinks are returned in row-major order over `(c, y, x)`.
/// Directory creation is idempotent; file creation truncates.
#[derive(Debug)]
pub struct SinkCreator;

impl SinkCreator {
    /// Create the tree under `base` and open `n_c * n_y * n_x` sinks.
    ///
    /// The outermost level is numbered from `c_start`, which lets successive
    /// chunk groups land in fresh directories under the same base.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on the first directory or file that cannot be
    /// created; sinks opened before the failure are closed on drop.
    pub fn create_grid(
        base: &Path,
        c_start: u64,
        n_c: u32,
        n_y: u32,
        n_x: u32,
    ) -> Result<Vec<FileSink>, SinkError> {
        let mut sinks = Vec::with_capacity(n_c as usize * n_y as usize * n_x as usize);
        for c in (0..u64::from(n_c)).map(|c| c_start + c) {
            for y in 0..n_y {
                let dir = base.join(format!("c{c}")).join(format!("y{y}"));
                std::fs::create_dir_all(&dir).map_err(|source| SinkError::new(&dir, source))?;
                for x in 0..n_x {
                    sinks.push(FileSink::create(dir.join(format!("x{x}")))?);
                }
            }
        }
        debug!(
            "opened {} sinks under {}",
            sinks.len(),
            base.to_string_lossy()
        );
        Ok(sinks)
    }

    /// Open a single sink at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if a directory or the file cannot be created.
    pub fn create_file(path: &Path) -> Result<FileSink, SinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SinkError::new(parent, source))?;
        }
        FileSink::create(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_layout_is_channel_then_y_then_x() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = SinkCreator::create_grid(dir.path(), 0, 2, 2, 3).unwrap();
        assert_eq!(sinks.len(), 12);
        assert_eq!(
            sinks[0].path(),
            dir.path().join("c0").join("y0").join("x0")
        );
        assert_eq!(
            sinks[11].path(),
            dir.path().join("c1").join("y1").join("x2")
        );
    }

    #[test]
    fn creation_truncates_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c0").join("y0").join("x0");
        {
            let mut sinks = SinkCreator::create_grid(dir.path(), 0, 1, 1, 1).unwrap();
            sinks[0].append(b"0123456789").unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
        let _ = SinkCreator::create_grid(dir.path(), 0, 1, 1, 1).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn append_tracks_bytes_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SinkCreator::create_file(&dir.path().join("meta").join("doc.json")).unwrap();
        sink.append(b"{}").unwrap();
        sink.append(b"\n").unwrap();
        assert_eq!(sink.bytes_written(), 3);
    }
}
