//! Byte sinks and on-disk layout creation.
//!
//! A [`Sink`] is an append-capable byte destination; one instance backs each
//! chunk file, shard file, or metadata document. [`SinkCreator`] materializes
//! the per-dimension directory tree and opens the sinks for one chunk group.

mod file;

pub use file::{FileSink, SinkCreator};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// An I/O failure on a sink, with the path it occurred on.
#[derive(Debug, Error)]
#[error("i/o failure on {}: {source}", path.display())]
pub struct SinkError {
    /// The file the failure occurred on.
    pub path: PathBuf,
    /// The underlying error.
    #[source]
    pub source: io::Error,
}

impl SinkError {
    pub(crate) fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// An append-capable byte destination.
pub trait Sink: Send {
    /// Append `bytes` at the current end of the sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on an I/O failure; the sink is unusable after.
    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Flush buffered bytes to the destination.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on an I/O failure.
    fn flush(&mut self) -> Result<(), SinkError>;

    /// Bytes appended so far.
    fn bytes_written(&self) -> u64;
}
