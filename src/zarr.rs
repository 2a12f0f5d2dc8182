//! The acquisition sink orchestrator.
//!
//! [`ZarrSink`] owns the writer ladder, the shared thread pool, and the
//! dataset root. Frames enter through [`append`](ZarrSink::append), cascade
//! through the multiscale scalers on the caller thread, and land in one
//! sharded writer per level. [`finalize`](ZarrSink::finalize) drains the
//! ladder and writes every metadata document strictly after the data.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::codec::BloscCompressionParams;
use crate::dimension::{ArrayConfig, ConfigError, Dimension};
use crate::downsample::{downsample_frame, downsample_levels, FrameScaler};
use crate::image::{Frame, FrameView, ImageShape, ShapeMismatchError};
use crate::metadata::{to_document_string, ArrayMetadata, GroupMetadata, RootMetadata};
use crate::sink::{Sink, SinkCreator, SinkError};
use crate::thread_pool::ThreadPool;
use crate::writer::{ArrayWriter, ShardedWriter, WriterContext, WriterError};

/// A sink failure surfaced to the acquisition host.
#[derive(Debug, Error)]
pub enum ZarrError {
    /// The sink was misconfigured.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A writer failed.
    #[error(transparent)]
    Writer(#[from] WriterError),
    /// A metadata sink failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// A metadata document could not be serialized.
    #[error("failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),
    /// An operation arrived in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Everything the acquisition host supplies to open a sink.
#[derive(Clone, Debug)]
pub struct StorageProperties {
    /// The dataset root directory.
    pub dataset_root: PathBuf,
    /// Array axes, fastest-varying first, append dimension last.
    pub dimensions: Vec<Dimension>,
    /// An opaque JSON document stored under the group attributes.
    pub external_metadata_json: Option<String>,
    /// Chunk compression, or `None` for raw chunks.
    pub compression: Option<BloscCompressionParams>,
    /// Whether to build the multiscale pyramid.
    pub enable_multiscale: bool,
    /// Worker threads for compression and shard packing; 0 picks the
    /// available parallelism.
    pub thread_count: usize,
}

/// Capability flags advertised to the acquisition host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StoragePropertyMetadata {
    /// Chunked layout is supported.
    pub chunking_is_supported: bool,
    /// Sharded layout is supported.
    pub sharding_is_supported: bool,
    /// Whether multiscale support is advertised.
    ///
    /// Conservatively `false`; the cascade still runs when enabled.
    pub multiscale_is_supported: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SinkState {
    Configured,
    Reserved,
    Finalized,
}

/// The streaming dataset sink.
pub struct ZarrSink {
    dataset_root: PathBuf,
    dimensions: Vec<Dimension>,
    compression: Option<BloscCompressionParams>,
    enable_multiscale: bool,
    external_metadata: Option<serde_json::Value>,
    pool: Arc<ThreadPool>,
    writers: Vec<ArrayWriter>,
    /// Temporal pairing holders for levels 1.., index shifted by one.
    scalers: Vec<FrameScaler>,
    image_shape: Option<ImageShape>,
    state: SinkState,
}

impl ZarrSink {
    /// Validate `props` and open the sink.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unusable root, dimension list,
    /// or external metadata document, and a pool error if workers cannot be
    /// spawned.
    pub fn configure(props: StorageProperties) -> Result<Self, ZarrError> {
        if props.dataset_root.as_os_str().is_empty() || props.dataset_root.is_file() {
            return Err(ConfigError::InvalidRoot(props.dataset_root).into());
        }
        ArrayConfig::validate_dimensions(&props.dimensions)?;
        let external_metadata = props
            .external_metadata_json
            .as_deref()
            .filter(|text| !text.is_empty())
            .map(serde_json::from_str)
            .transpose()
            .map_err(ConfigError::from)?;

        let thread_count = match props.thread_count {
            0 => std::thread::available_parallelism().map_or(4, NonZeroUsize::get),
            n => n,
        };
        let pool = Arc::new(ThreadPool::new(thread_count).map_err(WriterError::from)?);

        info!(
            "configured sink at {} with {} dimensions, compression {}",
            props.dataset_root.to_string_lossy(),
            props.dimensions.len(),
            props.compression.map_or("off".to_string(), |params| params
                .codec_id
                .to_string()),
        );
        Ok(Self {
            dataset_root: props.dataset_root,
            dimensions: props.dimensions,
            compression: props.compression,
            enable_multiscale: props.enable_multiscale,
            external_metadata,
            pool,
            writers: Vec::new(),
            scalers: Vec::new(),
            image_shape: None,
            state: SinkState::Configured,
        })
    }

    /// Capability flags of this sink flavor.
    #[must_use]
    pub const fn get_meta(&self) -> StoragePropertyMetadata {
        StoragePropertyMetadata {
            chunking_is_supported: true,
            sharding_is_supported: true,
            multiscale_is_supported: false,
        }
    }

    /// Record the per-frame geometry and allocate the writer ladder.
    ///
    /// Callable exactly once, before the first [`append`](Self::append).
    ///
    /// # Errors
    ///
    /// Returns [`ZarrError::InvalidState`] out of order and [`ConfigError`]
    /// if the shape disagrees with the configured extents.
    pub fn reserve_image_shape(&mut self, shape: ImageShape) -> Result<(), ZarrError> {
        if self.state != SinkState::Configured {
            return Err(ZarrError::InvalidState("image shape already reserved"));
        }

        let level0 = ArrayConfig {
            image_shape: shape,
            dimensions: self.dimensions.clone(),
            data_root: self.dataset_root.join("data").join("root").join("0"),
            compression: self.compression,
        };
        let context = WriterContext::new(Arc::clone(&self.pool));

        self.writers
            .push(ArrayWriter::Sharded(ShardedWriter::new(
                level0.clone(),
                context.clone(),
            )?));
        if self.enable_multiscale {
            for (level, config) in downsample_levels(&level0) {
                self.writers.push(ArrayWriter::Sharded(ShardedWriter::new(
                    config,
                    context.clone(),
                )?));
                self.scalers.push(FrameScaler::new());
                debug!("allocated multiscale writer for level {level}");
            }
        }

        self.image_shape = Some(shape);
        self.state = SinkState::Reserved;
        Ok(())
    }

    /// The number of array levels (1 without multiscale).
    #[must_use]
    pub fn levels(&self) -> usize {
        self.writers.len()
    }

    /// Frames written at `level`, if the level exists.
    #[must_use]
    pub fn frames_written(&self, level: usize) -> Option<u64> {
        self.writers.get(level).map(ArrayWriter::frames_written)
    }

    /// Append `n_frames` frames packed contiguously in `bytes`.
    ///
    /// Returns the number of frames accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeMismatchError::PayloadLength`] (via [`WriterError`]) if
    /// `bytes` is not exactly `n_frames` frames, and any writer error that
    /// taints the sink.
    pub fn append(&mut self, bytes: &[u8], n_frames: u32) -> Result<u32, ZarrError> {
        let shape = *self
            .image_shape
            .as_ref()
            .ok_or(ZarrError::InvalidState("no image shape reserved"))?;
        let frame_bytes = shape.bytes_per_frame();
        if bytes.len() != frame_bytes * n_frames as usize {
            return Err(WriterError::from(ShapeMismatchError::PayloadLength {
                expected: frame_bytes * n_frames as usize,
                actual: bytes.len(),
            })
            .into());
        }
        let frames = bytes
            .chunks_exact(frame_bytes)
            .map(|frame| FrameView::new(shape, frame).expect("sliced to frame length"))
            .collect::<Vec<_>>();
        self.append_frames(&frames)
    }

    /// Append individually shaped frames.
    ///
    /// A frame whose geometry does not match the reserved shape is logged and
    /// skipped; the returned count excludes it. Any other failure taints the
    /// sink and is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ZarrError::InvalidState`] before a shape is reserved, and
    /// the first terminal writer error.
    pub fn append_frames(&mut self, frames: &[FrameView<'_>]) -> Result<u32, ZarrError> {
        if self.state != SinkState::Reserved {
            return Err(ZarrError::InvalidState(
                "append requires a configured, unfinalized sink with a reserved shape",
            ));
        }
        let mut accepted = 0;
        for frame in frames {
            match self.append_one(frame) {
                Ok(()) => accepted += 1,
                Err(error) if error.is_recoverable() => {
                    warn!("rejected frame: {error}");
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(accepted)
    }

    fn append_one(&mut self, frame: &FrameView<'_>) -> Result<(), WriterError> {
        self.writers[0].write_frame(frame)?;

        // Propagate through the cascade on this thread: each level halves the
        // previous one spatially, and its scaler pairs frames temporally.
        let mut source: Option<Frame> = None;
        for level in 1..self.writers.len() {
            let scaled = match &source {
                None => downsample_frame(frame),
                Some(previous) => downsample_frame(&previous.view()),
            };
            match self.scalers[level - 1].push(scaled) {
                None => break,
                Some(emitted) => {
                    self.writers[level].write_frame(&emitted.view())?;
                    source = Some(emitted);
                }
            }
        }
        Ok(())
    }

    /// Drain the cascade, finalize every writer, and write all metadata.
    ///
    /// Cleanup continues past failures; the first error is returned. The sink
    /// is terminal afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first writer or metadata error encountered.
    pub fn finalize(&mut self) -> Result<(), ZarrError> {
        if self.state == SinkState::Finalized {
            return Ok(());
        }
        let was_reserved = self.state == SinkState::Reserved;
        self.state = SinkState::Finalized;
        if !was_reserved {
            return Err(ZarrError::InvalidState("nothing reserved to finalize"));
        }

        let mut first_error: Option<ZarrError> = None;

        // Unpaired held frames go out alone before the writers close.
        for (level, scaler) in (1..).zip(&mut self.scalers) {
            if let Some(residual) = scaler.take_residual() {
                if let Err(error) = self.writers[level].write_frame(&residual.view()) {
                    first_error = first_error.or(Some(error.into()));
                }
            }
        }
        for writer in &mut self.writers {
            if let Err(error) = writer.finalize() {
                first_error = first_error.or(Some(error.into()));
            }
        }

        // Metadata goes out strictly after every data write has completed.
        if let Err(error) = self.write_metadata() {
            first_error = first_error.or(Some(error));
        }

        info!(
            "finalized dataset at {} with {} levels, {} frames at level 0",
            self.dataset_root.to_string_lossy(),
            self.writers.len(),
            self.writers.first().map_or(0, ArrayWriter::frames_written),
        );
        first_error.map_or(Ok(()), Err)
    }

    fn write_metadata(&self) -> Result<(), ZarrError> {
        let root_doc = to_document_string(&RootMetadata::default())?;
        Self::write_document(&self.dataset_root.join("zarr.json"), &root_doc)?;

        let group_doc =
            to_document_string(&GroupMetadata::new(self.external_metadata.clone()))?;
        Self::write_document(
            &self.dataset_root.join("meta").join("root.group.json"),
            &group_doc,
        )?;

        for (level, writer) in self.writers.iter().enumerate() {
            let array_doc = to_document_string(&ArrayMetadata::for_level(
                writer.config(),
                writer.frames_written(),
            ))?;
            Self::write_document(
                &self
                    .dataset_root
                    .join("meta")
                    .join("root")
                    .join(format!("{level}.array.json")),
                &array_doc,
            )?;
        }
        Ok(())
    }

    fn write_document(path: &std::path::Path, document: &str) -> Result<(), ZarrError> {
        let mut sink = SinkCreator::create_file(path)?;
        sink.append(document.as_bytes())?;
        sink.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for ZarrSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZarrSink")
            .field("dataset_root", &self.dataset_root)
            .field("levels", &self.writers.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
