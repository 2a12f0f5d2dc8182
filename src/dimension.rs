//! Array dimensions and derived tiling geometry.
//!
//! An acquisition array is described by an ordered list of [`Dimension`]s,
//! fastest-varying first, with the unbounded append dimension last. The
//! spatial chunk extents partition every frame into tiles; the append
//! dimension's chunk extent sets how many frames accumulate into one chunk.

use std::num::NonZeroU64;
use std::path::PathBuf;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::BloscCompressionParams;
use crate::image::ImageShape;

/// The semantic of an array axis.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
    /// A spatial axis (frame width or height).
    Space,
    /// The channel axis.
    Channel,
    /// The temporal axis, along which frames arrive.
    Time,
    /// Any other axis.
    Other,
}

/// An invalid array configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The dimension list does not describe a writable array.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),
    /// The dataset root is not usable.
    #[error("invalid dataset root {}", _0.display())]
    InvalidRoot(PathBuf),
    /// The external metadata string is not valid JSON.
    #[error("external metadata is not valid JSON: {0}")]
    InvalidExternalMetadata(#[from] serde_json::Error),
    /// The image shape does not match the configured extents.
    #[error("image shape does not match dimensions: {0}")]
    ShapeExtentMismatch(String),
}

/// One array axis: name, kind, and extents.
///
/// `array_size_px == 0` marks the unbounded append dimension. A nonzero
/// extent need not be a multiple of the chunk extent; trailing partial chunks
/// are zero-padded when flushed.
#[derive(Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[display("{name} ({kind:?}): {array_size_px} px, {chunk_size_px} px/chunk, {shard_size_chunks} chunks/shard")]
pub struct Dimension {
    /// The axis name, e.g. `"x"`.
    pub name: String,
    /// The axis kind.
    pub kind: DimensionKind,
    /// Total extent in pixels; 0 for the unbounded append dimension.
    pub array_size_px: u64,
    /// Chunk extent in pixels along this axis.
    pub chunk_size_px: NonZeroU64,
    /// Chunks per shard along this axis.
    pub shard_size_chunks: NonZeroU64,
}

impl Dimension {
    /// Create a dimension.
    pub fn new(
        name: impl Into<String>,
        kind: DimensionKind,
        array_size_px: u64,
        chunk_size_px: NonZeroU64,
        shard_size_chunks: NonZeroU64,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            array_size_px,
            chunk_size_px,
            shard_size_chunks,
        }
    }

    /// The number of chunks along this axis (0 for the append dimension).
    #[must_use]
    pub const fn chunk_count(&self) -> u64 {
        self.array_size_px.div_ceil(self.chunk_size_px.get())
    }

    /// The number of shards along this axis (0 for the append dimension).
    #[must_use]
    pub const fn shard_count(&self) -> u64 {
        self.chunk_count().div_ceil(self.shard_size_chunks.get())
    }
}

/// The full configuration of one array level.
///
/// Immutable once a writer has been constructed from it.
#[derive(Clone, Debug)]
pub struct ArrayConfig {
    /// Per-frame geometry.
    pub image_shape: ImageShape,
    /// Axes, fastest-varying first, append dimension last.
    pub dimensions: Vec<Dimension>,
    /// Directory under which this level's chunk data is written.
    pub data_root: PathBuf,
    /// Optional chunk compression parameters.
    pub compression: Option<BloscCompressionParams>,
}

impl ArrayConfig {
    /// Validate the dimension list.
    ///
    /// Requires two leading spatial dimensions (`x` then `y`), at most one
    /// channel dimension, and a trailing unbounded append dimension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDimensions`] on any violation.
    pub fn validate_dimensions(dimensions: &[Dimension]) -> Result<(), ConfigError> {
        if dimensions.len() < 3 || dimensions.len() > 4 {
            return Err(ConfigError::InvalidDimensions(format!(
                "expected 3 or 4 dimensions, got {}",
                dimensions.len()
            )));
        }
        for dim in &dimensions[..2] {
            if dim.kind != DimensionKind::Space {
                return Err(ConfigError::InvalidDimensions(format!(
                    "dimension {} must be spatial",
                    dim.name
                )));
            }
            if dim.array_size_px == 0 {
                return Err(ConfigError::InvalidDimensions(format!(
                    "spatial dimension {} must have a nonzero extent",
                    dim.name
                )));
            }
        }
        if dimensions.len() == 4 {
            let channel = &dimensions[2];
            if channel.kind != DimensionKind::Channel || channel.array_size_px == 0 {
                return Err(ConfigError::InvalidDimensions(format!(
                    "dimension {} must be a bounded channel axis",
                    channel.name
                )));
            }
        }
        let append = dimensions.last().expect("len checked above");
        if append.array_size_px != 0 {
            return Err(ConfigError::InvalidDimensions(format!(
                "append dimension {} must be unbounded (extent 0)",
                append.name
            )));
        }
        if append.kind != DimensionKind::Time {
            return Err(ConfigError::InvalidDimensions(format!(
                "append dimension {} must be temporal",
                append.name
            )));
        }
        Ok(())
    }

    /// Validate that `image_shape` matches the configured extents.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ShapeExtentMismatch`] if the frame geometry
    /// disagrees with the spatial or channel extents.
    pub fn validate_image_shape(&self) -> Result<(), ConfigError> {
        let shape = &self.image_shape;
        let (x, y) = (&self.dimensions[0], &self.dimensions[1]);
        if u64::from(shape.width) != x.array_size_px || u64::from(shape.height) != y.array_size_px {
            return Err(ConfigError::ShapeExtentMismatch(format!(
                "frame is {}x{} px but dimensions declare {}x{}",
                shape.width, shape.height, x.array_size_px, y.array_size_px
            )));
        }
        let channels = self
            .channel_dimension()
            .map_or(1, |channel| channel.array_size_px);
        if u64::from(shape.channels) != channels {
            return Err(ConfigError::ShapeExtentMismatch(format!(
                "frame has {} channels but dimensions declare {channels}",
                shape.channels
            )));
        }
        Ok(())
    }

    /// The append dimension (always last).
    #[must_use]
    pub fn append_dimension(&self) -> &Dimension {
        self.dimensions.last().expect("validated non-empty")
    }

    /// The channel dimension, if one is declared.
    #[must_use]
    pub fn channel_dimension(&self) -> Option<&Dimension> {
        (self.dimensions.len() == 4).then(|| &self.dimensions[2])
    }

    /// Frames per chunk along the append dimension.
    #[must_use]
    pub fn frames_per_chunk(&self) -> u32 {
        u32::try_from(self.append_dimension().chunk_size_px.get()).unwrap_or(u32::MAX)
    }
}

/// Tiling geometry derived from an [`ArrayConfig`].
///
/// Tiles partition a frame spatially (and across channels when a channel
/// dimension is chunked); each tile position owns one chunk buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TileGeometry {
    /// Frame width in pixels.
    pub frame_width: u32,
    /// Frame height in pixels.
    pub frame_height: u32,
    /// Channel planes per frame.
    pub channels: u32,
    /// Tile width in pixels (x chunk extent).
    pub tile_width: u32,
    /// Tile height in pixels (y chunk extent).
    pub tile_height: u32,
    /// Channels per chunk.
    pub tile_channels: u32,
    /// Tiles along x.
    pub tiles_x: u32,
    /// Tiles along y.
    pub tiles_y: u32,
    /// Tiles along the channel axis.
    pub tiles_c: u32,
    /// Bytes per sample.
    pub bytes_per_pixel: usize,
    /// Frames accumulated into one chunk.
    pub frames_per_chunk: u32,
}

impl TileGeometry {
    /// Derive the tiling geometry for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the dimension list is invalid or disagrees
    /// with the image shape.
    pub fn new(config: &ArrayConfig) -> Result<Self, ConfigError> {
        ArrayConfig::validate_dimensions(&config.dimensions)?;
        config.validate_image_shape()?;

        let shape = &config.image_shape;
        let (x, y) = (&config.dimensions[0], &config.dimensions[1]);
        let tile_width = clamp_u32(x.chunk_size_px.get());
        let tile_height = clamp_u32(y.chunk_size_px.get());
        let tile_channels = config
            .channel_dimension()
            .map_or(1, |channel| clamp_u32(channel.chunk_size_px.get()));

        Ok(Self {
            frame_width: shape.width,
            frame_height: shape.height,
            channels: shape.channels,
            tile_width,
            tile_height,
            tile_channels,
            tiles_x: shape.width.div_ceil(tile_width),
            tiles_y: shape.height.div_ceil(tile_height),
            tiles_c: shape.channels.div_ceil(tile_channels),
            bytes_per_pixel: shape.pixel_type.size_of(),
            frames_per_chunk: config.frames_per_chunk(),
        })
    }

    /// Tiles per frame across all non-append axes.
    #[must_use]
    pub const fn tiles_per_frame(&self) -> usize {
        self.tiles_c as usize * self.tiles_y as usize * self.tiles_x as usize
    }

    /// Bytes of one tile plane (one frame's worth of one tile).
    #[must_use]
    pub const fn plane_bytes(&self) -> usize {
        self.tile_width as usize
            * self.tile_height as usize
            * self.tile_channels as usize
            * self.bytes_per_pixel
    }

    /// Bytes of one full chunk buffer.
    #[must_use]
    pub const fn chunk_bytes(&self) -> usize {
        self.plane_bytes() * self.frames_per_chunk as usize
    }

    /// Row-major tile index for tile coordinates (channel outermost).
    #[must_use]
    pub const fn tile_index(&self, tc: u32, ty: u32, tx: u32) -> usize {
        (tc as usize * self.tiles_y as usize + ty as usize) * self.tiles_x as usize + tx as usize
    }
}

const fn clamp_u32(value: u64) -> u32 {
    if value > u32::MAX as u64 {
        u32::MAX
    } else {
        value as u32
    }
}
