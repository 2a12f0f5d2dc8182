//! The sharded writer.
//!
//! A shard file stores a rectangular region of chunks followed by an index of
//! `(offset, size)` little-endian u64 pairs, one per chunk slot, at the tail.
//! Slots that never received a chunk hold the `(u64::MAX, u64::MAX)` sentinel
//! pair. Shard files cover `shard_size_chunks` chunks along every dimension;
//! along the append dimension this is the number of flushes that accumulate
//! into one file before the index is written and the writer rolls over.

use itertools::iproduct;
use log::{debug, warn};

use crate::dimension::{ArrayConfig, TileGeometry};
use crate::image::FrameView;
use crate::sink::{FileSink, Sink, SinkCreator};
use crate::thread_pool::ThreadPool;

use super::chunks::{compress_chunks, ChunkBuffers};
use super::{validate_frame, WriterContext, WriterError};

/// The sentinel index entry for a chunk slot with no data.
pub const SHARD_INDEX_SENTINEL: u64 = u64::MAX;

/// Shard partitioning derived from an [`ArrayConfig`].
#[derive(Clone, Debug)]
pub(crate) struct ShardGeometry {
    /// Chunks per shard along x, y, channel.
    shard_x: u32,
    shard_y: u32,
    shard_c: u32,
    /// Chunks (flushes) per shard along the append dimension.
    shard_t: u64,
    /// Shard files per frame along x, y, channel.
    shards_x: u32,
    shards_y: u32,
    shards_c: u32,
}

impl ShardGeometry {
    fn new(config: &ArrayConfig, tiles: &TileGeometry) -> Self {
        let clamp = |value: u64| u32::try_from(value).unwrap_or(u32::MAX);
        let shard_x = clamp(config.dimensions[0].shard_size_chunks.get());
        let shard_y = clamp(config.dimensions[1].shard_size_chunks.get());
        let shard_c = config
            .channel_dimension()
            .map_or(1, |channel| clamp(channel.shard_size_chunks.get()));
        Self {
            shard_x,
            shard_y,
            shard_c,
            shard_t: config.append_dimension().shard_size_chunks.get(),
            shards_x: tiles.tiles_x.div_ceil(shard_x),
            shards_y: tiles.tiles_y.div_ceil(shard_y),
            shards_c: tiles.tiles_c.div_ceil(shard_c),
        }
    }

    /// Shard files per frame.
    fn shards_per_frame(&self) -> usize {
        self.shards_c as usize * self.shards_y as usize * self.shards_x as usize
    }

    /// Index slots per shard file.
    fn chunks_per_shard(&self) -> usize {
        self.shard_c as usize
            * self.shard_y as usize
            * self.shard_x as usize
            * usize::try_from(self.shard_t).unwrap_or(usize::MAX)
    }

    /// The slot of a chunk within its shard.
    ///
    /// Linearized over the reversed dimension order (append slowest, x
    /// fastest), matching how a reader iterating the declared dimensions
    /// expects the index laid out.
    fn slot(&self, time_in_shard: u64, pc: u32, py: u32, px: u32) -> usize {
        (((usize::try_from(time_in_shard).expect("bounded by shard_t") * self.shard_c as usize
            + pc as usize)
            * self.shard_y as usize
            + py as usize)
            * self.shard_x as usize)
            + px as usize
    }
}

/// One open shard file plus its index under construction.
#[derive(Debug)]
struct ShardState {
    sink: FileSink,
    index: Vec<u64>,
}

impl ShardState {
    fn append_chunk(&mut self, slot: usize, bytes: &[u8]) -> Result<(), crate::sink::SinkError> {
        self.index[2 * slot] = self.sink.bytes_written();
        self.index[2 * slot + 1] = bytes.len() as u64;
        self.sink.append(bytes)
    }

    fn append_index_and_flush(&mut self) -> Result<(), crate::sink::SinkError> {
        let mut encoded = Vec::with_capacity(self.index.len() * 8);
        for word in &self.index {
            encoded.extend_from_slice(&word.to_le_bytes());
        }
        self.sink.append(&encoded)?;
        self.sink.flush()
    }
}

/// A writer packing chunks into indexed shard files.
#[derive(Debug)]
pub struct ShardedWriter {
    config: ArrayConfig,
    shards: ShardGeometry,
    buffers: ChunkBuffers,
    context: WriterContext,
    open_shards: Vec<ShardState>,
    frames_written: u64,
    current_chunk: u64,
    tainted: bool,
    finalized: bool,
}

impl ShardedWriter {
    /// Create a writer for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::Config`] if the configuration is invalid.
    pub fn new(config: ArrayConfig, context: WriterContext) -> Result<Self, WriterError> {
        let tiles = TileGeometry::new(&config)?;
        let shards = ShardGeometry::new(&config, &tiles);
        Ok(Self {
            config,
            shards,
            buffers: ChunkBuffers::new(tiles),
            context,
            open_shards: Vec::new(),
            frames_written: 0,
            current_chunk: 0,
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
            self.flush(false).inspect_err(|err| {
                warn!("shard flush failed: {err}");
                self.tainted = true;
            })?;
        }
        Ok(())
    }

    /// Pad and flush a partial chunk, complete open shards, close all sinks.
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
            self.open_shards.clear();
            return Err(WriterError::Tainted);
        }
        let result = if self.buffers.planes_buffered() > 0 {
            self.flush(true)
        } else {
            self.complete_open_shards()
        };
        debug!(
            "finalized sharded writer at {} after {} frames",
            self.config.data_root.to_string_lossy(),
            self.frames_written
        );
        result
    }

    /// Flush the completed (or padded) chunk of every tile into its shard.
    fn flush(&mut self, last: bool) -> Result<(), WriterError> {
        let tiles = self.buffers.geometry().clone();
        let shards = self.shards.clone();
        let time_in_shard = self.current_chunk % shards.shard_t;
        let shard_complete = last || time_in_shard + 1 == shards.shard_t;

        if self.open_shards.is_empty() {
            let group = self.current_chunk / shards.shard_t;
            let sinks = SinkCreator::create_grid(
                &self.config.data_root,
                group * u64::from(shards.shards_c),
                shards.shards_c,
                shards.shards_y,
                shards.shards_x,
            )?;
            let slots = shards.chunks_per_shard();
            self.open_shards = sinks
                .into_iter()
                .map(|sink| ShardState {
                    sink,
                    index: vec![SHARD_INDEX_SENTINEL; 2 * slots],
                })
                .collect();
        }

        let raw = self.buffers.take();
        let compressed = match &self.config.compression {
            Some(params) => {
                let (raw, compressed) = compress_chunks(
                    self.context.pool(),
                    params,
                    tiles.bytes_per_pixel,
                    raw,
                )?;
                self.buffers.restore(raw);
                compressed
            }
            None => raw,
        };

        // Partition the chunk payloads by shard, in canonical order (x varies
        // fastest), so offsets increase with slot numbers within each shard.
        let mut members: Vec<Vec<(usize, usize, Vec<u8>)>> =
            (0..shards.shards_per_frame()).map(|_| Vec::new()).collect();
        let mut payloads: Vec<Option<Vec<u8>>> = compressed.into_iter().map(Some).collect();
        for (sc, sy, sx) in iproduct!(0..shards.shards_c, 0..shards.shards_y, 0..shards.shards_x) {
            let shard_index = (sc as usize * shards.shards_y as usize + sy as usize)
                * shards.shards_x as usize
                + sx as usize;
            for (pc, py, px) in iproduct!(0..shards.shard_c, 0..shards.shard_y, 0..shards.shard_x)
            {
                let (tc, ty, tx) = (
                    sc * shards.shard_c + pc,
                    sy * shards.shard_y + py,
                    sx * shards.shard_x + px,
                );
                if tc >= tiles.tiles_c || ty >= tiles.tiles_y || tx >= tiles.tiles_x {
                    continue; // edge shard; the slot keeps its sentinel
                }
                let tile = tiles.tile_index(tc, ty, tx);
                let slot = shards.slot(time_in_shard, pc, py, px);
                let payload = payloads[tile].take().expect("each tile packed once");
                members[shard_index].push((tile, slot, payload));
            }
        }

        // One job per shard; each worker owns its shard state exclusively.
        let return_buffers = self.config.compression.is_none();
        let completions: Vec<_> = self
            .open_shards
            .drain(..)
            .zip(members)
            .map(|(mut shard, members)| {
                self.context.pool().submit(move || {
                    let mut returned = Vec::new();
                    for (tile, slot, payload) in members {
                        shard.append_chunk(slot, &payload).map_err(|err| err.to_string())?;
                        if return_buffers {
                            returned.push((tile, payload));
                        }
                    }
                    if shard_complete {
                        shard.append_index_and_flush().map_err(|err| err.to_string())?;
                    }
                    Ok((shard, returned))
                })
            })
            .collect();
        let results = ThreadPool::join_all(completions)?;

        let mut raw_buffers = vec![Vec::new(); tiles.tiles_per_frame()];
        for (shard, returned) in results {
            self.open_shards.push(shard);
            for (tile, payload) in returned {
                raw_buffers[tile] = payload;
            }
        }
        if return_buffers {
            self.buffers.restore(raw_buffers);
        }

        self.current_chunk += 1;
        if shard_complete {
            // Indices are on disk; dropping the states closes the files.
            self.open_shards.clear();
        }
        Ok(())
    }

    /// Write the index of every open shard and close it.
    ///
    /// Reached when an acquisition ends exactly on a chunk boundary partway
    /// through a shard's append extent.
    fn complete_open_shards(&mut self) -> Result<(), WriterError> {
        let mut first_error = None;
        for mut shard in self.open_shards.drain(..) {
            if let Err(err) = shard.append_index_and_flush() {
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

    fn read_index(file: &[u8], chunks_per_shard: usize) -> Vec<(u64, u64)> {
        let index = &file[file.len() - 16 * chunks_per_shard..];
        index
            .chunks_exact(16)
            .map(|pair| {
                (
                    u64::from_le_bytes(pair[..8].try_into().unwrap()),
                    u64::from_le_bytes(pair[8..].try_into().unwrap()),
                )
            })
            .collect()
    }

    fn config(root: &std::path::Path, shard: (u64, u64, u64)) -> ArrayConfig {
        ArrayConfig {
            image_shape: ImageShape::new(4, 4, 1, PixelType::U8),
            dimensions: vec![
                Dimension::new("x", DimensionKind::Space, 4, nz(2), nz(shard.0)),
                Dimension::new("y", DimensionKind::Space, 4, nz(2), nz(shard.1)),
                Dimension::new("t", DimensionKind::Time, 0, nz(1), nz(shard.2)),
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
    fn whole_frame_shard_packs_all_tiles_with_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ShardedWriter::new(config(dir.path(), (2, 2, 1)), context()).unwrap();
        writer.write_frame(&frame(5).view()).unwrap();
        writer.finalize().unwrap();

        let file = std::fs::read(dir.path().join("c0/y0/x0")).unwrap();
        // 4 tiles of 4 bytes each plus a 4-slot index
        assert_eq!(file.len(), 4 * 4 + 16 * 4);
        let index = read_index(&file, 4);
        assert_eq!(index, vec![(0, 4), (4, 4), (8, 4), (12, 4)]);
        assert_eq!(&file[..16], &[5u8; 16]);
    }

    #[test]
    fn one_shard_per_tile_accumulates_along_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ShardedWriter::new(config(dir.path(), (1, 1, 2)), context()).unwrap();
        for i in 0..4 {
            writer.write_frame(&frame(i).view()).unwrap();
        }
        writer.finalize().unwrap();

        // 2x2 shard files per group, two groups of two chunks each
        for (group, fills) in [(0u8, [0u8, 1]), (1, [2, 3])] {
            for (y, x) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let path = dir.path().join(format!("c{group}/y{y}/x{x}"));
                let file = std::fs::read(path).unwrap();
                assert_eq!(file.len(), 2 * 4 + 16 * 2);
                assert_eq!(&file[..4], &[fills[0]; 4]);
                assert_eq!(&file[4..8], &[fills[1]; 4]);
                assert_eq!(read_index(&file, 2), vec![(0, 4), (4, 4)]);
            }
        }
    }

    #[test]
    fn edge_shards_keep_sentinel_slots() {
        // 3 tiles along x with shards of 2: the second shard has one column
        let dir = tempfile::tempdir().unwrap();
        let config = ArrayConfig {
            image_shape: ImageShape::new(6, 2, 1, PixelType::U8),
            dimensions: vec![
                Dimension::new("x", DimensionKind::Space, 6, nz(2), nz(2)),
                Dimension::new("y", DimensionKind::Space, 2, nz(2), nz(1)),
                Dimension::new("t", DimensionKind::Time, 0, nz(1), nz(1)),
            ],
            data_root: dir.path().to_path_buf(),
            compression: None,
        };
        let mut writer = ShardedWriter::new(config, context()).unwrap();
        writer.write_frame(
            &Frame::new(ImageShape::new(6, 2, 1, PixelType::U8), vec![3; 12])
                .unwrap()
                .view(),
        )
        .unwrap();
        writer.finalize().unwrap();

        let edge = std::fs::read(dir.path().join("c0/y0/x1")).unwrap();
        // one 4-byte chunk plus a 2-slot index
        assert_eq!(edge.len(), 4 + 16 * 2);
        assert_eq!(
            read_index(&edge, 2),
            vec![(0, 4), (SHARD_INDEX_SENTINEL, SHARD_INDEX_SENTINEL)]
        );
    }

    #[test]
    fn boundary_finalize_writes_index_of_open_shard() {
        // two chunks per shard along append, but only one chunk arrives
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ShardedWriter::new(config(dir.path(), (2, 2, 2)), context()).unwrap();
        writer.write_frame(&frame(8).view()).unwrap();
        writer.finalize().unwrap();

        let file = std::fs::read(dir.path().join("c0/y0/x0")).unwrap();
        // 4 tiles of 4 bytes plus an 8-slot index; second time slot all sentinels
        assert_eq!(file.len(), 16 + 16 * 8);
        let index = read_index(&file, 8);
        assert!(index[..4].iter().all(|&(_, size)| size == 4));
        assert!(index[4..]
            .iter()
            .all(|&pair| pair == (SHARD_INDEX_SENTINEL, SHARD_INDEX_SENTINEL)));
    }

    #[test]
    fn offsets_point_inside_the_payload_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ShardedWriter::new(config(dir.path(), (2, 2, 1)), context()).unwrap();
        for i in 0..3 {
            writer.write_frame(&frame(i).view()).unwrap();
        }
        writer.finalize().unwrap();

        for group in 0..3 {
            let file = std::fs::read(dir.path().join(format!("c{group}/y0/x0"))).unwrap();
            let payload_len = (file.len() - 16 * 4) as u64;
            let mut last_end = 0;
            for (offset, size) in read_index(&file, 4) {
                assert!(offset >= last_end);
                assert!(offset + size <= payload_len);
                last_end = offset + size;
            }
        }
    }
}
