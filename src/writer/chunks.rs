//! Per-tile chunk buffers and the tiling copy.
//!
//! Each tile position owns one chunk buffer of
//! `tile bytes * frames_per_chunk`. Buffers are allocated zeroed on the first
//! frame and re-zeroed (never reallocated) after every flush, so boundary
//! tiles and padded planes read back as the fill value.

use itertools::iproduct;

use crate::codec::{compress_bytes, BloscCompressionParams};
use crate::dimension::TileGeometry;
use crate::image::FrameView;
use crate::thread_pool::ThreadPool;

use super::WriterError;

/// The chunk accumulation state shared by both writer flavors.
#[derive(Debug)]
pub(crate) struct ChunkBuffers {
    geometry: TileGeometry,
    buffers: Vec<Vec<u8>>,
    planes_buffered: u32,
}

impl ChunkBuffers {
    pub(crate) fn new(geometry: TileGeometry) -> Self {
        Self {
            geometry,
            buffers: Vec::new(),
            planes_buffered: 0,
        }
    }

    pub(crate) fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub(crate) fn planes_buffered(&self) -> u32 {
        self.planes_buffered
    }

    pub(crate) fn bytes_pending_flush(&self) -> u64 {
        self.planes_buffered as u64
            * self.geometry.plane_bytes() as u64
            * self.geometry.tiles_per_frame() as u64
    }

    /// Copy one frame into every tile's buffer at the current plane.
    ///
    /// Returns `true` when the frame completed a chunk.
    pub(crate) fn write_plane(&mut self, frame: &FrameView<'_>) -> bool {
        debug_assert!(self.planes_buffered < self.geometry.frames_per_chunk);
        if self.buffers.is_empty() {
            self.buffers = vec![vec![0u8; self.geometry.chunk_bytes()]; self.geometry.tiles_per_frame()];
        }

        let geometry = &self.geometry;
        let bpp = geometry.bytes_per_pixel;
        let src = frame.bytes();
        let plane_offset = self.planes_buffered as usize * geometry.plane_bytes();
        for (tc, ty, tx) in iproduct!(
            0..geometry.tiles_c,
            0..geometry.tiles_y,
            0..geometry.tiles_x
        ) {
            let buffer = &mut self.buffers[geometry.tile_index(tc, ty, tx)];
            let c0 = tc * geometry.tile_channels;
            let y0 = ty * geometry.tile_height;
            let x0 = tx * geometry.tile_width;
            // Clip the source copy at the frame boundary; the bytes beyond it
            // stay zero in the destination.
            let n_channels = geometry.tile_channels.min(geometry.channels - c0);
            let n_rows = geometry.tile_height.min(geometry.frame_height - y0);
            let row_bytes = geometry.tile_width.min(geometry.frame_width - x0) as usize * bpp;
            for (channel, row) in iproduct!(0..n_channels, 0..n_rows) {
                let src_offset = (((c0 + channel) as usize * geometry.frame_height as usize
                    + (y0 + row) as usize)
                    * geometry.frame_width as usize
                    + x0 as usize)
                    * bpp;
                let dst_offset = plane_offset
                    + (channel as usize * geometry.tile_height as usize + row as usize)
                        * geometry.tile_width as usize
                        * bpp;
                buffer[dst_offset..dst_offset + row_bytes]
                    .copy_from_slice(&src[src_offset..src_offset + row_bytes]);
            }
        }

        self.planes_buffered += 1;
        self.planes_buffered == self.geometry.frames_per_chunk
    }

    /// Move the buffers out for a flush.
    ///
    /// Partial trailing planes are already zero, so a short chunk leaves the
    /// buffers padded to `frames_per_chunk` with the fill value.
    pub(crate) fn take(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.buffers)
    }

    /// Hand the buffers back after a flush, zeroed for reuse.
    pub(crate) fn restore(&mut self, mut buffers: Vec<Vec<u8>>) {
        for buffer in &mut buffers {
            buffer.fill(0);
        }
        self.buffers = buffers;
        self.planes_buffered = 0;
    }
}

/// Compress every chunk buffer in parallel on the pool.
///
/// Buffers move into the jobs and move back out, so they can be re-zeroed and
/// reused. Outputs are returned parallel to the inputs.
pub(crate) fn compress_chunks(
    pool: &ThreadPool,
    params: &BloscCompressionParams,
    typesize: usize,
    buffers: Vec<Vec<u8>>,
) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), WriterError> {
    let n = buffers.len();
    let completions: Vec<_> = buffers
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let params = *params;
            pool.submit(move || {
                let compressed =
                    compress_bytes(&raw, &params, typesize).map_err(|err| err.to_string())?;
                Ok((index, raw, compressed))
            })
        })
        .collect();

    let mut raws: Vec<Vec<u8>> = (0..n).map(|_| Vec::new()).collect();
    let mut outputs: Vec<Vec<u8>> = (0..n).map(|_| Vec::new()).collect();
    for (index, raw, compressed) in ThreadPool::join_all(completions)? {
        raws[index] = raw;
        outputs[index] = compressed;
    }
    Ok((raws, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{ArrayConfig, Dimension, DimensionKind};
    use crate::image::{Frame, ImageShape, PixelType};
    use std::num::NonZeroU64;
    use std::path::PathBuf;

    fn nz(value: u64) -> NonZeroU64 {
        NonZeroU64::new(value).unwrap()
    }

    fn geometry(frame: (u64, u64), tile: (u64, u64), fpc: u64) -> TileGeometry {
        let config = ArrayConfig {
            image_shape: ImageShape::new(frame.0 as u32, frame.1 as u32, 1, PixelType::U8),
            dimensions: vec![
                Dimension::new("x", DimensionKind::Space, frame.0, nz(tile.0), nz(1)),
                Dimension::new("y", DimensionKind::Space, frame.1, nz(tile.1), nz(1)),
                Dimension::new("t", DimensionKind::Time, 0, nz(fpc), nz(1)),
            ],
            data_root: PathBuf::from("."),
            compression: None,
        };
        TileGeometry::new(&config).unwrap()
    }

    fn ramp_frame(width: u32, height: u32) -> Frame {
        let shape = ImageShape::new(width, height, 1, PixelType::U8);
        let bytes = (0..shape.bytes_per_frame()).map(|i| i as u8).collect();
        Frame::new(shape, bytes).unwrap()
    }

    #[test]
    fn interior_tile_copies_rows_contiguously() {
        let mut buffers = ChunkBuffers::new(geometry((4, 4), (2, 2), 1));
        let frame = ramp_frame(4, 4);
        assert!(buffers.write_plane(&frame.view()));
        let tiles = buffers.take();
        assert_eq!(tiles.len(), 4);
        // tile (ty=0, tx=1) holds columns 2..4 of rows 0..2
        assert_eq!(tiles[1], vec![2, 3, 6, 7]);
        // tile (ty=1, tx=0) holds columns 0..2 of rows 2..4
        assert_eq!(tiles[2], vec![8, 9, 12, 13]);
    }

    #[test]
    fn boundary_tiles_are_zero_padded() {
        // 5x3 frame, 4x2 tiles: right and bottom tiles extend past the frame
        let mut buffers = ChunkBuffers::new(geometry((5, 3), (4, 2), 1));
        let frame = ramp_frame(5, 3);
        buffers.write_plane(&frame.view());
        let tiles = buffers.take();
        assert_eq!(tiles.len(), 4);
        // tile (0, 1): one real column (4), rest zero
        assert_eq!(tiles[1], vec![4, 0, 0, 0, 9, 0, 0, 0]);
        // tile (1, 0): one real row (10..14), second row zero
        assert_eq!(tiles[2], vec![10, 11, 12, 13, 0, 0, 0, 0]);
        // tile (1, 1): single real sample
        assert_eq!(tiles[3], vec![14, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn planes_stack_within_a_chunk() {
        let mut buffers = ChunkBuffers::new(geometry((2, 2), (2, 2), 3));
        let frame = ramp_frame(2, 2);
        assert!(!buffers.write_plane(&frame.view()));
        assert_eq!(buffers.planes_buffered(), 1);
        assert!(!buffers.write_plane(&frame.view()));
        assert!(buffers.write_plane(&frame.view()));
        let tiles = buffers.take();
        assert_eq!(tiles[0], [0u8, 1, 2, 3].repeat(3));
    }

    #[test]
    fn restore_zeroes_for_reuse() {
        let mut buffers = ChunkBuffers::new(geometry((2, 2), (2, 2), 2));
        let frame = ramp_frame(2, 2);
        buffers.write_plane(&frame.view());
        buffers.write_plane(&frame.view());
        let tiles = buffers.take();
        buffers.restore(tiles);
        assert_eq!(buffers.planes_buffered(), 0);
        let tiles = buffers.take();
        assert!(tiles.iter().all(|tile| tile.iter().all(|&byte| byte == 0)));
    }

    #[test]
    fn partial_chunk_is_padded_with_fill_value() {
        let mut buffers = ChunkBuffers::new(geometry((2, 2), (2, 2), 3));
        let frame = ramp_frame(2, 2);
        buffers.write_plane(&frame.view());
        let tiles = buffers.take();
        assert_eq!(tiles[0][..4], [0, 1, 2, 3]);
        assert!(tiles[0][4..].iter().all(|&byte| byte == 0));
    }
}
