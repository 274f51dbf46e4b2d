//! The Zarr v3 sharded array writer (C9): packs whole layers of chunks into
//! per-shard files, each ending in a CRC32C-checked index table.
//!
//! A shard's file holds `shard_size_chunks_append` layers worth of chunks
//! along the append axis, packed back to back with no gaps — chunks are
//! written in table order as they arrive, so the on-disk layout is already
//! defragmented without a separate compaction pass over a pre-sized buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::array::common::ChunkLattice;
use crate::array::{
    decode_inner_index, v3_array_metadata_sharded, v3_shard_path, ArrayBehavior, ArrayConfig,
};
use crate::dimension::{ArrayDimensions, SHARD_SENTINEL};
use crate::error::Result;
use crate::storage::sink::{Sink, SinkFactory};
use crate::thread_pool::ThreadPool;

/// Per-(inner-shard) accumulation state, live for one append-shard's worth of
/// layers and reset at rollover.
struct ShardState {
    sink: Option<Arc<dyn Sink>>,
    table: Vec<u64>,
    file_offset: u64,
}

impl ShardState {
    fn fresh(chunks_per_shard: u64) -> Self {
        Self {
            sink: None,
            table: vec![SHARD_SENTINEL; 2 * chunks_per_shard as usize],
            file_offset: 0,
        }
    }
}

pub struct ShardArray {
    config: ArrayConfig,
    lattice: ChunkLattice,
    sink_factory: Arc<dyn SinkFactory>,
    thread_pool: Arc<ThreadPool>,
    frames_written: u64,
    append_chunk_index: u64,
    shard_states: Vec<ShardState>,
    current_append_shard_index: Option<u64>,
    dirty: bool,
}

impl ShardArray {
    /// # Errors
    /// Never fails today; kept fallible to match [`crate::array::chunk_array::ChunkArray::new`].
    pub fn new(
        config: ArrayConfig,
        sink_factory: Arc<dyn SinkFactory>,
        thread_pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        let lattice = ChunkLattice::new(Arc::clone(&config.dims));
        let total_inner_shards: u64 = config.dims.inner_shards_along().iter().product();
        let chunks_per_shard = config.dims.chunks_per_shard();
        let shard_states = (0..total_inner_shards)
            .map(|_| ShardState::fresh(chunks_per_shard))
            .collect();
        Ok(Self {
            config,
            lattice,
            sink_factory,
            thread_pool,
            frames_written: 0,
            append_chunk_index: 0,
            shard_states,
            current_append_shard_index: None,
            dirty: false,
        })
    }

    /// Compress one layer's worth of chunks and pack them into their shard
    /// files in table order; roll the shard over if this layer completed it.
    fn flush(&mut self) -> Result<()> {
        let buffers = self.lattice.take_and_reset();
        let n = buffers.len();
        let compression = self.config.compression;
        let compressed: Arc<Mutex<Vec<Option<Vec<u8>>>>> = Arc::new(Mutex::new(vec![None; n]));

        for (chunk_linear, buffer) in buffers.into_iter().enumerate() {
            let compressed = Arc::clone(&compressed);
            self.thread_pool.spawn(move || {
                let payload = match compression {
                    Some(params) => crate::codec::compress(&params, &buffer)?,
                    None => buffer,
                };
                compressed.lock().unwrap()[chunk_linear] = Some(payload);
                Ok(())
            });
        }
        self.thread_pool.join_and_check()?;
        let compressed = Arc::try_unwrap(compressed).unwrap().into_inner().unwrap();

        let shard_size_chunks_append = u64::from(self.config.dims.shard_size_chunks_append());
        let layer_within_shard = self.append_chunk_index % shard_size_chunks_append;
        let append_shard_index = self.append_chunk_index / shard_size_chunks_append;
        let chunks_per_shard_layer = self.config.dims.chunks_per_shard_layer();

        log::debug!(
            "v3 array {}: flushing append chunk {} (shard {}, layer {} of {})",
            self.config.node_path,
            self.append_chunk_index,
            append_shard_index,
            layer_within_shard,
            shard_size_chunks_append
        );
        self.current_append_shard_index = Some(append_shard_index);

        let mut by_shard: HashMap<u64, Vec<(u64, Vec<u8>)>> = HashMap::new();
        for (chunk_linear, payload) in compressed.into_iter().enumerate() {
            let payload = payload.expect("every spawned compression job populates its slot");
            let chunk_linear = chunk_linear as u64;
            let shard_index = self.config.dims.shard_index_for_chunk(chunk_linear);
            let internal = self.config.dims.shard_internal_index(chunk_linear);
            let table_index = layer_within_shard * chunks_per_shard_layer + internal;
            by_shard.entry(shard_index).or_default().push((table_index, payload));
        }

        for (shard_index, mut entries) in by_shard {
            entries.sort_by_key(|(table_index, _)| *table_index);
            let path = v3_shard_path(
                &self.config.node_path,
                append_shard_index,
                &decode_inner_index(shard_index, self.config.dims.inner_shards_along()),
            );
            let state = &mut self.shard_states[shard_index as usize];
            if state.sink.is_none() {
                state.sink = Some(self.sink_factory.create_sink(&path)?);
            }
            let sink = state.sink.as_ref().unwrap();
            for (table_index, payload) in entries {
                let size = payload.len() as u64;
                sink.write(state.file_offset, &payload)?;
                state.table[2 * table_index as usize] = state.file_offset;
                state.table[2 * table_index as usize + 1] = size;
                state.file_offset += size;
            }
        }

        self.append_chunk_index += 1;
        self.dirty = false;

        if self.append_chunk_index % shard_size_chunks_append == 0 {
            self.roll_over_shards()?;
        }
        self.write_metadata()?;
        Ok(())
    }

    /// Write each still-open shard's index table and CRC32C trailer, then
    /// reset it for the next append shard. Safe to call on a ragged final
    /// shard that never reached its full chunk quota.
    fn roll_over_shards(&mut self) -> Result<()> {
        let chunks_per_shard = self.config.dims.chunks_per_shard();
        for state in &mut self.shard_states {
            let Some(sink) = state.sink.take() else {
                continue;
            };
            let mut table_bytes = Vec::with_capacity(state.table.len() * 8);
            for entry in &state.table {
                table_bytes.extend_from_slice(&entry.to_le_bytes());
            }
            sink.write(state.file_offset, &table_bytes)?;
            let crc = crc32c::crc32c(&table_bytes);
            sink.write(state.file_offset + table_bytes.len() as u64, &crc.to_le_bytes())?;
            sink.finalize()?;
            state.file_offset = 0;
            state.table = vec![SHARD_SENTINEL; 2 * chunks_per_shard as usize];
        }
        self.current_append_shard_index = None;
        Ok(())
    }

    fn write_metadata(&self) -> Result<()> {
        let meta = v3_array_metadata_sharded(
            &self.config.dims,
            self.config.compression.as_ref(),
            self.frames_written,
        );
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let meta_path = format!("{}/zarr.json", self.config.node_path);
        let sink = self.sink_factory.create_sink(&meta_path)?;
        sink.write(0, &meta_bytes)?;
        sink.finalize()?;
        Ok(())
    }
}

impl ArrayBehavior for ShardArray {
    fn write_frame(&mut self, frame_id: u64, bytes: &[u8]) -> Result<usize> {
        let consumed = self.lattice.write_frame(frame_id, bytes)?;
        if consumed == 0 {
            return Ok(0);
        }
        self.frames_written += 1;
        self.dirty = true;
        if self.frames_written % self.config.dims.frames_per_flush() == 0 {
            self.flush()?;
        }
        Ok(consumed)
    }

    fn close(&mut self) -> Result<()> {
        if self.dirty {
            self.flush()?;
        }
        if self.current_append_shard_index.is_some() {
            self.roll_over_shards()?;
            self.write_metadata()?;
        }
        Ok(())
    }

    fn dims(&self) -> &ArrayDimensions {
        &self.config.dims
    }

    fn metadata_keys(&self) -> Vec<String> {
        vec![format!("{}/zarr.json", self.config.node_path)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ZarrVersion;
    use crate::dimension::{ArrayDimensions, DataType, Dimension, DimensionKind};
    use crate::storage::memory_sink::MemorySinkFactory;

    /// t: unlimited append, chunk 1, shard 2 chunks. c: 2/2/1. y,x: 4/2/1.
    /// chunks_in_memory = c(1 chunk) * y(2) * x(2) = 4, one inner shard.
    fn small_dims() -> Arc<ArrayDimensions> {
        Arc::new(
            ArrayDimensions::new(
                vec![
                    Dimension::new("t", DimensionKind::Time, 0, 1).with_shard_size_chunks(2),
                    Dimension::new("c", DimensionKind::Channel, 2, 2).with_shard_size_chunks(1),
                    Dimension::new("y", DimensionKind::Space, 4, 2).with_shard_size_chunks(2),
                    Dimension::new("x", DimensionKind::Space, 4, 2).with_shard_size_chunks(2),
                ],
                DataType::UInt8,
                None,
            )
            .unwrap(),
        )
    }

    fn make_array() -> (ShardArray, Arc<MemorySinkFactory>) {
        let dims = small_dims();
        let factory = Arc::new(MemorySinkFactory::new());
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        let config = ArrayConfig {
            node_path: "0".to_string(),
            dims,
            compression: None,
            version: ZarrVersion::V3,
            level_of_detail: 0,
        };
        let array = ShardArray::new(config, factory.clone() as Arc<dyn SinkFactory>, pool).unwrap();
        (array, factory)
    }

    fn frame() -> Vec<u8> {
        vec![7u8; 16]
    }

    #[test]
    fn one_full_append_chunk_does_not_roll_over_a_two_chunk_shard() {
        let (mut array, factory) = make_array();
        // frames_per_flush = chunk_size_append(1) * total_middle(c=2) = 2
        array.write_frame(0, &frame()).unwrap();
        array.write_frame(1, &frame()).unwrap();
        let contents = factory.all_contents();
        assert!(contents.contains_key("0/zarr.json"));
        // shard file open but not finalized (no index table/crc appended yet):
        // 4 chunks * 16 bytes = 64 bytes written so far.
        let shard = contents.get("0/c/0/0/0/0").unwrap();
        assert_eq!(shard.len(), 64);
    }

    #[test]
    fn second_append_chunk_rolls_the_shard_over_with_index_and_crc() {
        let (mut array, factory) = make_array();
        for t in 0..2u64 {
            for _ in 0..2 {
                array.write_frame(t, &frame()).unwrap();
            }
        }
        let contents = factory.all_contents();
        let shard = contents.get("0/c/0/0/0/0").unwrap();
        // 2 layers * 4 chunks * 16 bytes = 128 bytes of packed chunk data,
        // plus an 8-chunk index table (2 * 8 u64s = 128 bytes) plus a 4-byte crc.
        assert_eq!(shard.len(), 128 + 128 + 4);
    }

    #[test]
    fn close_rolls_over_a_ragged_final_shard() {
        let (mut array, factory) = make_array();
        // Only complete one append chunk (t=0); the shard needed 2.
        array.write_frame(0, &frame()).unwrap();
        array.write_frame(1, &frame()).unwrap();
        array.close().unwrap();
        let contents = factory.all_contents();
        let shard = contents.get("0/c/0/0/0/0").unwrap();
        // 1 layer * 4 chunks * 16 bytes = 64 bytes, plus table + crc as above.
        assert_eq!(shard.len(), 64 + 128 + 4);
    }

    #[test]
    fn sentinel_entries_mark_chunks_never_written_in_a_ragged_shard() {
        let (mut array, factory) = make_array();
        array.write_frame(0, &frame()).unwrap();
        array.write_frame(1, &frame()).unwrap();
        array.close().unwrap();
        let contents = factory.all_contents();
        let shard = contents.get("0/c/0/0/0/0").unwrap();
        let table_start = 64;
        let second_layer_first_offset = u64::from_le_bytes(
            shard[table_start + 4 * 16..table_start + 4 * 16 + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(second_layer_first_offset, SHARD_SENTINEL);
    }
}
