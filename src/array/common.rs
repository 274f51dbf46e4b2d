//! Shared tile-scatter logic used by both the v2 chunk array and the v3
//! shard array: a dense, fill-value-initialized buffer for every chunk that
//! coexists in memory during one flush cycle, plus the row-wise memcpy that
//! lands one frame's pixels into every chunk its spatial extent touches.

use std::sync::Arc;

use crate::dimension::ArrayDimensions;
use crate::error::{Result, StreamingError};

/// The in-memory lattice of chunk buffers for one "layer" — one full sweep
/// over the middle and spatial axes for a fixed append-axis chunk.
///
/// Every buffer is allocated at its nominal (non-ragged) size and
/// zero-initialized; ragged edges (an array dimension not evenly divisible
/// by its chunk size) are simply never written to beyond the valid extent,
/// leaving the fill value (`0`) in place, matching the data model's fill
/// value convention.
pub struct ChunkLattice {
    dims: Arc<ArrayDimensions>,
    buffers: Vec<Vec<u8>>,
}

impl ChunkLattice {
    #[must_use]
    pub fn new(dims: Arc<ArrayDimensions>) -> Self {
        let n = dims.chunks_in_memory() as usize;
        let bytes_per_chunk = dims.bytes_per_chunk() as usize;
        let buffers = (0..n).map(|_| vec![0u8; bytes_per_chunk]).collect();
        Self { dims, buffers }
    }

    #[must_use]
    pub fn dims(&self) -> &ArrayDimensions {
        &self.dims
    }

    #[must_use]
    pub fn buffer(&self, chunk_index: u64) -> &[u8] {
        &self.buffers[chunk_index as usize]
    }

    /// Scatter one frame's pixels into every chunk its spatial extent
    /// touches.
    ///
    /// Returns the number of bytes consumed from `bytes`: the full frame
    /// size on success, or `0` if `bytes.len()` did not match the expected
    /// frame size (logged at `warn`, not an error — see the data model's
    /// partial-write resolution).
    ///
    /// # Errors
    /// Returns [`StreamingError::InvalidIndex`] if `frame_id`, once
    /// transposed, would address a chunk outside the lattice — unreachable
    /// for a frame id produced by the coordinator, but checked rather than
    /// indexed unchecked.
    pub fn write_frame(&mut self, frame_id: u64, bytes: &[u8]) -> Result<usize> {
        let expected = self.dims.bytes_per_frame() as usize;
        if bytes.len() != expected {
            log::warn!(
                "frame {frame_id}: expected {expected} bytes, got {} — dropping",
                bytes.len()
            );
            return Ok(0);
        }

        let transposed = self.dims.transpose_frame_id(frame_id);
        let tile_base = self.dims.tile_group_offset(transposed);
        let chunk_internal_offset = self.dims.chunk_internal_offset(transposed) as usize;

        let height = self.dims.height_dim();
        let width = self.dims.width_dim();
        let bytes_per_px = self.dims.data_type().bytes_of_type();
        let array_h = height.array_size_px;
        let array_w = width.array_size_px;
        let chunk_h = u64::from(height.chunk_size_px);
        let chunk_w = u64::from(width.chunk_size_px);
        let n_tiles_y = chunk_count(array_h, chunk_h);
        let n_tiles_x = chunk_count(array_w, chunk_w);
        let row_bytes_full = array_w as usize * bytes_per_px;

        for ty in 0..n_tiles_y {
            let y_start = ty * chunk_h;
            let y_end = (y_start + chunk_h).min(array_h);
            for tx in 0..n_tiles_x {
                let x_start = tx * chunk_w;
                let x_end = (x_start + chunk_w).min(array_w);
                let row_len_bytes = (x_end - x_start) as usize * bytes_per_px;

                let chunk_index = tile_base + ty * n_tiles_x + tx;
                if chunk_index >= self.dims.chunks_in_memory() {
                    return Err(StreamingError::InvalidIndex(format!(
                        "frame {frame_id} addressed chunk {chunk_index}, lattice has {}",
                        self.dims.chunks_in_memory()
                    )));
                }
                let dest = &mut self.buffers[chunk_index as usize];

                for y in y_start..y_end {
                    let src_offset = y as usize * row_bytes_full + x_start as usize * bytes_per_px;
                    let dest_row = (y - y_start) as usize;
                    let dest_offset = chunk_internal_offset
                        + dest_row * (chunk_w as usize * bytes_per_px);
                    dest[dest_offset..dest_offset + row_len_bytes]
                        .copy_from_slice(&bytes[src_offset..src_offset + row_len_bytes]);
                }
            }
        }

        Ok(expected)
    }

    /// Swap out the current buffers for a freshly zeroed set, returning the
    /// ones that were just filled. Called once per flush cycle.
    pub fn take_and_reset(&mut self) -> Vec<Vec<u8>> {
        let bytes_per_chunk = self.dims.bytes_per_chunk() as usize;
        let n = self.buffers.len();
        std::mem::replace(
            &mut self.buffers,
            (0..n).map(|_| vec![0u8; bytes_per_chunk]).collect(),
        )
    }
}

fn chunk_count(array_size: u64, chunk_size: u64) -> u64 {
    (array_size + chunk_size - 1) / chunk_size.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{DataType, Dimension, DimensionKind};

    fn dims() -> Arc<ArrayDimensions> {
        Arc::new(
            ArrayDimensions::new(
                vec![
                    Dimension::new("t", DimensionKind::Time, 0, 1),
                    Dimension::new("y", DimensionKind::Space, 4, 2),
                    Dimension::new("x", DimensionKind::Space, 6, 2),
                ],
                DataType::UInt8,
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn write_frame_fills_every_touched_chunk() {
        let dims = dims();
        let mut lattice = ChunkLattice::new(dims.clone());
        let frame: Vec<u8> = (0..24u8).collect(); // 4x6 frame, 1 byte/px
        lattice.write_frame(0, &frame).unwrap();
        // chunks_in_memory = (4/2)*(6/2) = 6
        assert_eq!(dims.chunks_in_memory(), 6);
        // first chunk covers rows 0..2, cols 0..2
        let c0 = lattice.buffer(0);
        assert_eq!(c0, &[0, 1, 6, 7]);
    }

    #[test]
    fn mismatched_frame_size_is_dropped_not_errored() {
        let dims = dims();
        let mut lattice = ChunkLattice::new(dims);
        let result = lattice.write_frame(0, &[0u8; 3]).unwrap();
        assert_eq!(result, 0);
    }

    #[test]
    fn take_and_reset_returns_filled_buffers_and_clears_state() {
        let dims = dims();
        let mut lattice = ChunkLattice::new(dims.clone());
        let frame: Vec<u8> = vec![9u8; 24];
        lattice.write_frame(0, &frame).unwrap();
        let filled = lattice.take_and_reset();
        assert!(filled[0].iter().any(|&b| b == 9));
        assert!(lattice.buffer(0).iter().all(|&b| b == 0));
    }
}
