//! Multiscale downsampling.
//!
//! Level k+1 halves level k spatially (2×2 mean per channel plane) and
//! temporally (pairwise frame mean). Integer arithmetic truncates toward
//! zero; a dimension already at one pixel replicates its single edge.

use num::cast::AsPrimitive;

use crate::dimension::{ArrayConfig, DimensionKind};
use crate::image::{Frame, FrameView, ImageShape, PixelType};

/// One sample of any supported pixel type.
trait Sample: Copy + AsPrimitive<f64> + 'static
where
    f64: AsPrimitive<Self>,
{
    const BYTES: usize;
    fn read(bytes: &[u8]) -> Self;
    fn append_to(self, out: &mut Vec<u8>);
}

macro_rules! impl_sample {
    ($($t:ty),*) => {$(
        impl Sample for $t {
            const BYTES: usize = std::mem::size_of::<$t>();

            fn read(bytes: &[u8]) -> Self {
                <$t>::from_ne_bytes(bytes.try_into().expect("one sample"))
            }

            fn append_to(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

impl_sample!(u8, u16, i8, i16, f32);

macro_rules! dispatch_pixel_type {
    ($pixel_type:expr, $func:ident ( $($arg:expr),* $(,)? )) => {
        match $pixel_type {
            PixelType::U8 => $func::<u8>($($arg),*),
            PixelType::U16 => $func::<u16>($($arg),*),
            PixelType::I8 => $func::<i8>($($arg),*),
            PixelType::I16 => $func::<i16>($($arg),*),
            PixelType::F32 => $func::<f32>($($arg),*),
        }
    };
}

const fn half(extent: u32) -> u32 {
    let halved = extent / 2;
    if halved == 0 {
        1
    } else {
        halved
    }
}

const fn half_u64(extent: u64) -> u64 {
    let halved = extent / 2;
    if halved == 0 {
        1
    } else {
        halved
    }
}

/// Derive the next level's configuration from `src`.
///
/// Spatial extents halve (floor division, minimum 1); chunk extents are
/// capped at the new array extent and shard extents at the new chunk count.
/// Returns `false` once the source frame fits a single tile (every spatial
/// extent at or below its chunk extent): there is no further level.
#[must_use]
pub fn downsample_config(src: &ArrayConfig) -> (ArrayConfig, bool) {
    let single_tile = src
        .dimensions
        .iter()
        .filter(|dim| dim.kind == DimensionKind::Space)
        .all(|dim| dim.array_size_px <= dim.chunk_size_px.get());
    if single_tile {
        return (src.clone(), false);
    }

    let mut dst = src.clone();
    for dim in &mut dst.dimensions {
        if dim.kind != DimensionKind::Space {
            continue;
        }
        dim.array_size_px = half_u64(dim.array_size_px);
        dim.chunk_size_px = dim.chunk_size_px.min(
            std::num::NonZeroU64::new(dim.array_size_px).expect("spatial extents stay nonzero"),
        );
        dim.shard_size_chunks = dim.shard_size_chunks.min(
            std::num::NonZeroU64::new(dim.chunk_count()).expect("chunk counts stay nonzero"),
        );
    }
    dst.image_shape = ImageShape::new(
        half(src.image_shape.width),
        half(src.image_shape.height),
        src.image_shape.channels,
        src.image_shape.pixel_type,
    );
    (dst, true)
}

/// The ladder of downsampled configurations below `level0`.
///
/// Yields `(level, config)` pairs starting at level 1; each level's data root
/// replaces the final path component of the previous one with the level
/// number.
pub fn downsample_levels(level0: &ArrayConfig) -> impl Iterator<Item = (usize, ArrayConfig)> {
    let root_parent = level0.data_root.parent().map(std::path::Path::to_path_buf);
    let mut config = level0.clone();
    let mut level = 0usize;
    std::iter::from_fn(move || {
        let (mut next, downsampled) = downsample_config(&config);
        if !downsampled {
            return None;
        }
        level += 1;
        if let Some(parent) = &root_parent {
            next.data_root = parent.join(level.to_string());
        }
        config = next.clone();
        Some((level, next))
    })
}

fn scale_plane_samples<T: Sample>(
    src: &[u8],
    shape: &ImageShape,
    dst_shape: &ImageShape,
    out: &mut Vec<u8>,
) where
    f64: AsPrimitive<T>,
{
    let (width, height) = (shape.width as usize, shape.height as usize);
    let sample_at = |plane: &[u8], y: usize, x: usize| {
        let index = (y * width + x) * T::BYTES;
        T::read(&plane[index..index + T::BYTES]).as_()
    };
    let plane_bytes = width * height * T::BYTES;
    for channel in 0..shape.channels as usize {
        let plane = &src[channel * plane_bytes..(channel + 1) * plane_bytes];
        for dy in 0..dst_shape.height as usize {
            let y0 = 2 * dy;
            let y1 = (y0 + 1).min(height - 1);
            for dx in 0..dst_shape.width as usize {
                let x0 = 2 * dx;
                let x1 = (x0 + 1).min(width - 1);
                let sum = sample_at(plane, y0, x0)
                    + sample_at(plane, y0, x1)
                    + sample_at(plane, y1, x0)
                    + sample_at(plane, y1, x1);
                let mean: T = (sum / 4.0).as_();
                mean.append_to(out);
            }
        }
    }
}

/// Produce the half-resolution rendition of one frame.
#[must_use]
pub fn downsample_frame(frame: &FrameView<'_>) -> Frame {
    let shape = frame.shape();
    let dst_shape = ImageShape::new(
        half(shape.width),
        half(shape.height),
        shape.channels,
        shape.pixel_type,
    );
    let mut out = Vec::with_capacity(dst_shape.bytes_per_frame());
    dispatch_pixel_type!(
        shape.pixel_type,
        scale_plane_samples(frame.bytes(), shape, &dst_shape, &mut out)
    );
    Frame::from_parts(dst_shape, out)
}

fn average_samples<T: Sample>(a: &[u8], b: &[u8], out: &mut Vec<u8>)
where
    f64: AsPrimitive<T>,
{
    for (a, b) in a.chunks_exact(T::BYTES).zip(b.chunks_exact(T::BYTES)) {
        let mean: T = ((T::read(a).as_() + T::read(b).as_()) / 2.0).as_();
        mean.append_to(out);
    }
}

/// The pairwise temporal mean of two same-shape frames.
#[must_use]
pub fn average_frames(a: &Frame, b: &Frame) -> Frame {
    debug_assert_eq!(a.shape(), b.shape());
    let mut out = Vec::with_capacity(a.bytes().len());
    dispatch_pixel_type!(
        a.shape().pixel_type,
        average_samples(a.bytes(), b.bytes(), &mut out)
    );
    Frame::from_parts(*a.shape(), out)
}

/// The 1-slot temporal pairing holder of one multiscale level.
///
/// The first frame of a pair is held; the second is averaged against it and
/// emitted. A frame still held when the acquisition ends is emitted alone.
#[derive(Debug, Default)]
pub struct FrameScaler {
    held: Option<Frame>,
}

impl FrameScaler {
    /// Create an empty holder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer one frame; returns the pair average every second call.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        match self.held.take() {
            None => {
                self.held = Some(frame);
                None
            }
            Some(held) => Some(average_frames(&held, &frame)),
        }
    }

    /// Take the unpaired frame, if one is held.
    pub fn take_residual(&mut self) -> Option<Frame> {
        self.held.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::Dimension;
    use std::num::NonZeroU64;
    use std::path::PathBuf;

    fn nz(value: u64) -> NonZeroU64 {
        NonZeroU64::new(value).unwrap()
    }

    fn config(width: u64, height: u64, tile: u64) -> ArrayConfig {
        ArrayConfig {
            image_shape: ImageShape::new(width as u32, height as u32, 1, PixelType::U8),
            dimensions: vec![
                Dimension::new("x", DimensionKind::Space, width, nz(tile.min(width)), nz(1)),
                Dimension::new("y", DimensionKind::Space, height, nz(tile.min(height)), nz(1)),
                Dimension::new("t", DimensionKind::Time, 0, nz(2), nz(1)),
            ],
            data_root: PathBuf::from("acq.zarr/data/root/0"),
            compression: None,
        }
    }

    #[test]
    fn config_halves_and_caps_chunks() {
        let (level1, downsampled) = downsample_config(&config(64, 24, 16));
        assert!(downsampled);
        assert_eq!(level1.dimensions[0].array_size_px, 32);
        assert_eq!(level1.dimensions[1].array_size_px, 12);
        assert_eq!(level1.dimensions[1].chunk_size_px.get(), 12);
        assert_eq!(level1.image_shape.width, 32);
        // append dimension untouched
        assert_eq!(level1.dimensions[2].chunk_size_px.get(), 2);
    }

    #[test]
    fn config_ladder_stops_at_a_single_tile() {
        let levels: Vec<_> = downsample_levels(&config(64, 64, 16)).collect();
        // 64 -> 32 -> 16, and 16x16 fits one tile
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].1.image_shape.width, 32);
        assert_eq!(levels[1].1.image_shape.width, 16);
        assert_eq!(levels[1].1.data_root, PathBuf::from("acq.zarr/data/root/2"));
        let (_, downsampled) = downsample_config(&levels[1].1);
        assert!(!downsampled);
    }

    #[test]
    fn config_ladder_with_unit_tiles_reaches_one_pixel() {
        let levels: Vec<_> = downsample_levels(&config(8, 8, 1)).collect();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[2].1.image_shape.width, 1);
        assert_eq!(levels[2].1.image_shape.height, 1);
    }

    #[test]
    fn spatial_mean_truncates_toward_zero() {
        let shape = ImageShape::new(2, 2, 1, PixelType::U8);
        let frame = Frame::new(shape, vec![1, 2, 2, 2]).unwrap();
        let scaled = downsample_frame(&frame.view());
        assert_eq!(scaled.shape().width, 1);
        // (1 + 2 + 2 + 2) / 4 = 1.75, truncated
        assert_eq!(scaled.bytes(), &[1]);

        let shape = ImageShape::new(2, 2, 1, PixelType::I8);
        let frame = Frame::new(shape, vec![255, 255, 254, 255]).unwrap(); // -1,-1,-2,-1
        let scaled = downsample_frame(&frame.view());
        assert_eq!(scaled.bytes(), &[255]); // -1.25 truncates to -1
    }

    #[test]
    fn float_mean_is_exact() {
        let shape = ImageShape::new(2, 2, 1, PixelType::F32);
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let frame = Frame::new(shape, bytes).unwrap();
        let scaled = downsample_frame(&frame.view());
        let value = f32::from_ne_bytes(scaled.bytes().try_into().unwrap());
        assert_eq!(value, 2.5);
    }

    #[test]
    fn single_pixel_rows_replicate() {
        // a 1x2 frame halves to 1x1; the lone column pairs with itself
        let shape = ImageShape::new(1, 2, 1, PixelType::U8);
        let frame = Frame::new(shape, vec![10, 20]).unwrap();
        let scaled = downsample_frame(&frame.view());
        assert_eq!(*scaled.shape(), ImageShape::new(1, 1, 1, PixelType::U8));
        assert_eq!(scaled.bytes(), &[15]);
    }

    #[test]
    fn scaler_pairs_frames_and_holds_residue() {
        let shape = ImageShape::new(1, 1, 1, PixelType::U8);
        let frame = |v: u8| Frame::new(shape, vec![v]).unwrap();
        let mut scaler = FrameScaler::new();
        assert!(scaler.push(frame(10)).is_none());
        let pair = scaler.push(frame(20)).unwrap();
        assert_eq!(pair.bytes(), &[15]);
        assert!(scaler.take_residual().is_none());
        assert!(scaler.push(frame(30)).is_none());
        assert_eq!(scaler.take_residual().unwrap().bytes(), &[30]);
    }
}
