//! A chunked, sharded Zarr V3 storage sink for streaming frame acquisition.
//!
//! `zarr_sink` is the write path of a scientific imaging pipeline: frames
//! arrive one at a time, are tiled spatially, accumulated into fixed-size
//! temporal chunks, optionally compressed with blosc, packed into indexed
//! shard files, and laid out on disk alongside the protocol metadata.
//!
//! The moving parts, leaves first:
//! - [`thread_pool::ThreadPool`]: a fixed worker pool with completion
//!   handles, shared by every writer.
//! - [`sink`]: append-only byte destinations and the on-disk tree creator.
//! - [`codec::blosc`]: the chunk compressor.
//! - [`writer`]: tiling, chunk accumulation, and the chunked/sharded flush
//!   strategies.
//! - [`downsample`]: the multiscale cascade.
//! - [`zarr::ZarrSink`]: the orchestrator the acquisition host drives.
//!
//! ## Example
//!
//! ```no_run
//! use std::num::NonZeroU64;
//! use zarr_sink::{
//!     BloscCodecId, BloscCompressionParams, BloscShuffle, Dimension, DimensionKind, ImageShape,
//!     PixelType, StorageProperties, ZarrSink,
//! };
//!
//! # fn main() -> Result<(), zarr_sink::ZarrError> {
//! let chunk = |px| NonZeroU64::new(px).unwrap();
//! let props = StorageProperties {
//!     dataset_root: "acquisition.zarr".into(),
//!     dimensions: vec![
//!         Dimension::new("x", DimensionKind::Space, 1920, chunk(960), chunk(2)),
//!         Dimension::new("y", DimensionKind::Space, 1080, chunk(540), chunk(2)),
//!         Dimension::new("t", DimensionKind::Time, 0, chunk(64), chunk(1)),
//!     ],
//!     external_metadata_json: None,
//!     compression: Some(
//!         BloscCompressionParams::new(BloscCodecId::Zstd, 1, BloscShuffle::Shuffle).unwrap(),
//!     ),
//!     enable_multiscale: false,
//!     thread_count: 0,
//! };
//!
//! let mut sink = ZarrSink::configure(props)?;
//! sink.reserve_image_shape(ImageShape::new(1920, 1080, 1, PixelType::U16))?;
//! # let frames: Vec<u8> = Vec::new();
//! let accepted = sink.append(&frames, 0)?;
//! sink.finalize()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod dimension;
pub mod downsample;
pub mod image;
pub mod metadata;
pub mod sink;
pub mod thread_pool;
pub mod writer;
pub mod zarr;

pub use codec::{BloscCodecId, BloscCompressionParams, BloscShuffle, CodecError};
pub use dimension::{ArrayConfig, ConfigError, Dimension, DimensionKind, TileGeometry};
pub use image::{Frame, FrameView, ImageShape, PixelType, ShapeMismatchError};
pub use sink::{Sink, SinkError};
pub use writer::{ArrayWriter, ChunkWriter, ShardedWriter, WriterContext, WriterError};
pub use zarr::{StorageProperties, StoragePropertyMetadata, ZarrError, ZarrSink};
