//! The chunk-per-file writer.
//!
//! Every tile position gets its own file per chunk group; successive chunks
//! along the append dimension go to the same file until the group's chunk
//! budget (the append dimension's `shard_size_chunks`) is exhausted, then the
//! writer rolls over to a fresh file set.

use log::{debug, warn};

use crate::dimension::{ArrayConfig, TileGeometry};
use crate::image::FrameView;
use crate::sink::{Sink, SinkCreator};
use crate::thread_pool::ThreadPool;

use super::chunks::{compress_chunks, ChunkBuffers};
use super::{validate_frame, WriterContext, WriterError};

/// A writer emitting bare chunk files.
#[derive(Debug)]
pub struct ChunkWriter {
    config: ArrayConfig,
    buffers: ChunkBuffers,
    context: WriterContext,
    sinks: Vec<crate::sink::FileSink>,
    frames_written: u64,
    current_chunk: u64,
    chunks_per_file: u64,
    tainted: bool,
    finalized: bool,
}

impl ChunkWriter {
    /// Create a writer for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::Config`] if the configuration is invalid.
    pub fn new(config: ArrayConfig, context: WriterContext) -> Result<Self, WriterError> {
        let geometry = TileGeometry::new(&config)?;
        let chunks_per_file = config.append_dimension().shard_size_chunks.get();
        Ok(Self {
            config,
            buffers: ChunkBuffers::new(geometry),
            context,
            sinks: Vec::new(),
            frames_written: 0,
            current_chunk: 0,
            chunks_per_file,
            tainted: false,
            finalized: false,
        })
    }

    /// The array configuration.
    #[must_use]
    pub fn config(&self) -> &ArrayConfig {
        &self.config
    }

    /// Frames accepted so far.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Bytes buffered but not yet flushed.
    #[must_use]
    pub fn bytes_pending_flush(&self) -> u64 {
        self.buffers.bytes_pending_flush()
    }

    /// Accept one frame; flushes when it completes a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::Shape`] for a rejected frame (the writer stays
    /// usable) or a flush error (the writer is tainted).
    pub fn write_frame(&mut self, frame: &FrameView<'_>) -> Result<(), WriterError> {
        if self.finalized {
            return Err(WriterError::Finalized);
        }
        if self.tainted {
            return Err(WriterError::Tainted);
        }
        validate_frame(&self.config.image_shape, frame)?;

        let chunk_complete = self.buffers.write_plane(frame);
        self.frames_written += 1;
        if chunk_complete {
            self.flush().inspect_err(|err| {
                warn!("chunk flush failed: {err}");
                self.tainted = true;
            })?;
        }
        debug_assert_eq!(
            self.frames_written,
            self.current_chunk * u64::from(self.buffers.geometry().frames_per_chunk)
                + u64::from(self.buffers.planes_buffered())
        );
        Ok(())
    }

    /// Pad and flush a partial chunk, then close all sinks.
    ///
    /// # Errors
    ///
    /// Returns the first flush or close error; cleanup continues regardless.
    pub fn finalize(&mut self) -> Result<(), WriterError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        if self.tainted {
            self.sinks.clear();
            return Err(WriterError::Tainted);
        }
        let result = if self.buffers.planes_buffered() > 0 {
            // Trailing planes of the buffers are zero, so the chunk goes out
            // padded to frames_per_chunk with the fill value.
            self.flush()
        } else {
            Ok(())
        };
        let closed = self.close_sinks();
        debug!(
            "finalized chunk writer at {} after {} frames",
            self.config.data_root.to_string_lossy(),
            self.frames_written
        );
        result.and(closed)
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        let geometry = self.buffers.geometry().clone();
        if self.sinks.is_empty() {
            let group = self.current_chunk / self.chunks_per_file;
            self.sinks = SinkCreator::create_grid(
                &self.config.data_root,
                group * u64::from(geometry.tiles_c),
                geometry.tiles_c,
                geometry.tiles_y,
                geometry.tiles_x,
            )?;
        }

        let raw = self.buffers.take();
        let payloads;
        if let Some(params) = &self.config.compression {
            let (raw, compressed) = compress_chunks(
                self.context.pool(),
                params,
                geometry.bytes_per_pixel,
                raw,
            )?;
            self.buffers.restore(raw);
            payloads = compressed;
        } else {
            payloads = raw;
        }

        // One job per file; each worker owns its sink and payload exclusively.
        let completions: Vec<_> = self
            .sinks
            .drain(..)
            .zip(payloads)
            .map(|(mut sink, payload)| {
                let return_payload = self.config.compression.is_none();
                self.context.pool().submit(move || {
                    sink.append(&payload).map_err(|err| err.to_string())?;
                    Ok((sink, return_payload.then_some(payload)))
                })
            })
            .collect();
        let results = ThreadPool::join_all(completions)?;

        let mut returned = Vec::with_capacity(results.len());
        for (sink, payload) in results {
            self.sinks.push(sink);
            if let Some(payload) = payload {
                returned.push(payload);
            }
        }
        if self.config.compression.is_none() {
            self.buffers.restore(returned);
        }

        self.current_chunk += 1;
        if self.current_chunk % self.chunks_per_file == 0 {
            self.close_sinks()?;
        }
        Ok(())
    }

    fn close_sinks(&mut self) -> Result<(), WriterError> {
        let mut first_error = None;
        for mut sink in self.sinks.drain(..) {
            if let Err(err) = sink.flush() {
                first_error = first_error.or(Some(err));
            }
        }
        first_error.map_or(Ok(()), |err| Err(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{Dimension, DimensionKind};
    use crate::image::{Frame, ImageShape, PixelType};
    use crate::thread_pool::ThreadPool;
    use std::num::NonZeroU64;
    use std::sync::Arc;

    fn nz(value: u64) -> NonZeroU64 {
        NonZeroU64::new(value).unwrap()
    }

    fn context() -> WriterContext {
        WriterContext::new(Arc::new(ThreadPool::new(2).unwrap()))
    }

    fn config(root: &std::path::Path, fpc: u64, chunks_per_file: u64) -> ArrayConfig {
        ArrayConfig {
            image_shape: ImageShape::new(4, 4, 1, PixelType::U8),
            dimensions: vec![
                Dimension::new("x", DimensionKind::Space, 4, nz(2), nz(1)),
                Dimension::new("y", DimensionKind::Space, 4, nz(4), nz(1)),
                Dimension::new("t", DimensionKind::Time, 0, nz(fpc), nz(chunks_per_file)),
            ],
            data_root: root.to_path_buf(),
            compression: None,
        }
    }

    fn frame(fill: u8) -> Frame {
        let shape = ImageShape::new(4, 4, 1, PixelType::U8);
        Frame::new(shape, vec![fill; 16]).unwrap()
    }

    #[test]
    fn uncompressed_chunk_files_hold_raw_tile_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(config(dir.path(), 1, 1), context()).unwrap();
        writer.write_frame(&frame(7).view()).unwrap();
        writer.finalize().unwrap();

        // two tiles along x, one chunk group per chunk
        let left = std::fs::read(dir.path().join("c0/y0/x0")).unwrap();
        let right = std::fs::read(dir.path().join("c0/y0/x1")).unwrap();
        assert_eq!(left, vec![7u8; 8]);
        assert_eq!(right, vec![7u8; 8]);
    }

    #[test]
    fn chunks_append_within_a_file_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(config(dir.path(), 1, 2), context()).unwrap();
        for i in 0..4 {
            writer.write_frame(&frame(i).view()).unwrap();
        }
        writer.finalize().unwrap();

        // chunks 0 and 1 share c0, chunks 2 and 3 share c1
        let first = std::fs::read(dir.path().join("c0/y0/x0")).unwrap();
        let second = std::fs::read(dir.path().join("c1/y0/x0")).unwrap();
        assert_eq!(first, [vec![0u8; 8], vec![1u8; 8]].concat());
        assert_eq!(second, [vec![2u8; 8], vec![3u8; 8]].concat());
    }

    #[test]
    fn partial_chunk_is_zero_padded_on_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(config(dir.path(), 3, 1), context()).unwrap();
        writer.write_frame(&frame(9).view()).unwrap();
        writer.write_frame(&frame(9).view()).unwrap();
        writer.finalize().unwrap();

        let bytes = std::fs::read(dir.path().join("c0/y0/x0")).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..16], &[9u8; 16]);
        assert!(bytes[16..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn mismatched_frame_is_rejected_without_tainting() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(config(dir.path(), 1, 1), context()).unwrap();
        let bad_shape = ImageShape::new(8, 4, 1, PixelType::U8);
        let bad = Frame::new(bad_shape, vec![0; 32]).unwrap();
        let err = writer.write_frame(&bad.view()).unwrap_err();
        assert!(err.is_recoverable());
        writer.write_frame(&frame(1).view()).unwrap();
        assert_eq!(writer.frames_written(), 1);
        writer.finalize().unwrap();
    }

    #[test]
    fn finalize_is_idempotent_and_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(config(dir.path(), 1, 1), context()).unwrap();
        writer.write_frame(&frame(1).view()).unwrap();
        writer.finalize().unwrap();
        writer.finalize().unwrap();
        assert!(matches!(
            writer.write_frame(&frame(2).view()),
            Err(WriterError::Finalized)
        ));
    }
}
