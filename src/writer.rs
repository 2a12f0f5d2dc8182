//! Frame writers: tiling, chunk accumulation, and flushing.
//!
//! Two writer flavors share one accumulation core:
//! [`ChunkWriter`] emits one file per chunk, [`ShardedWriter`] packs chunks
//! into shard files with a trailing offset/size index. The orchestrator
//! dispatches through [`ArrayWriter`] and never depends on a concrete flavor.

pub(crate) mod chunks;

mod chunked;
mod sharded;

pub use chunked::ChunkWriter;
pub use sharded::{ShardedWriter, SHARD_INDEX_SENTINEL};

use std::sync::Arc;

use thiserror::Error;

use crate::codec::CodecError;
use crate::dimension::{ArrayConfig, ConfigError};
use crate::image::{FrameView, ImageShape, ShapeMismatchError};
use crate::sink::SinkError;
use crate::thread_pool::{ThreadPool, ThreadPoolError};

/// A writer failure.
#[derive(Debug, Error)]
pub enum WriterError {
    /// The configuration cannot describe a writer.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A frame was rejected; the writer remains usable.
    #[error(transparent)]
    Shape(#[from] ShapeMismatchError),
    /// A sink failed during a flush.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// Chunk compression failed during a flush.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The thread pool failed or lost a job.
    #[error(transparent)]
    Pool(#[from] ThreadPoolError),
    /// An earlier flush failed; the writer rejects all further writes.
    #[error("writer has failed and rejects further writes")]
    Tainted,
    /// The writer is finalized and terminal.
    #[error("writer is finalized")]
    Finalized,
}

impl WriterError {
    /// Whether the error leaves the writer usable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Shape(_))
    }
}

/// Shared resources handed to every writer.
///
/// Writers receive this explicit context instead of a handle to whoever owns
/// them; the thread pool is shared across all levels of the writer ladder.
#[derive(Clone, Debug)]
pub struct WriterContext {
    pool: Arc<ThreadPool>,
}

impl WriterContext {
    /// Create a context over a shared pool.
    #[must_use]
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    /// The shared thread pool.
    #[must_use]
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}

pub(crate) fn validate_frame(
    expected: &ImageShape,
    frame: &FrameView<'_>,
) -> Result<(), ShapeMismatchError> {
    if frame.shape() == expected {
        Ok(())
    } else {
        Err(ShapeMismatchError::Shape {
            expected: *expected,
            actual: *frame.shape(),
        })
    }
}

/// A writer of either flavor, dispatched behind one capability set.
#[derive(Debug)]
pub enum ArrayWriter {
    /// One file per chunk.
    Chunked(ChunkWriter),
    /// Chunks grouped into indexed shard files.
    Sharded(ShardedWriter),
}

impl ArrayWriter {
    /// Accept one frame.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::Shape`] for a geometry mismatch (recoverable)
    /// or a flush error (terminal for this writer).
    pub fn write_frame(&mut self, frame: &FrameView<'_>) -> Result<(), WriterError> {
        match self {
            Self::Chunked(writer) => writer.write_frame(frame),
            Self::Sharded(writer) => writer.write_frame(frame),
        }
    }

    /// Pad and flush any partial chunk, then close every sink.
    ///
    /// # Errors
    ///
    /// Returns the first flush or close error.
    pub fn finalize(&mut self) -> Result<(), WriterError> {
        match self {
            Self::Chunked(writer) => writer.finalize(),
            Self::Sharded(writer) => writer.finalize(),
        }
    }

    /// Frames accepted so far.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        match self {
            Self::Chunked(writer) => writer.frames_written(),
            Self::Sharded(writer) => writer.frames_written(),
        }
    }

    /// The array configuration this writer was built from.
    #[must_use]
    pub fn config(&self) -> &ArrayConfig {
        match self {
            Self::Chunked(writer) => writer.config(),
            Self::Sharded(writer) => writer.config(),
        }
    }
}
