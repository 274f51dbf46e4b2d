//! The Zarr v2 chunk-based array writer (C8): one file per chunk, rewritten
//! on every flush since the append axis grows the logical `shape`.

use std::sync::Arc;

use crate::array::common::ChunkLattice;
use crate::array::{decode_inner_index, v2_array_metadata, v2_chunk_path, ArrayBehavior, ArrayConfig};
use crate::dimension::ArrayDimensions;
use crate::error::Result;
use crate::storage::sink::SinkFactory;
use crate::thread_pool::ThreadPool;

pub struct ChunkArray {
    config: ArrayConfig,
    lattice: ChunkLattice,
    sink_factory: Arc<dyn SinkFactory>,
    thread_pool: Arc<ThreadPool>,
    frames_written: u64,
    append_chunk_index: u64,
    dirty: bool,
}

impl ChunkArray {
    /// # Errors
    /// Never fails today (lattice allocation is infallible); kept fallible to
    /// match [`crate::array::shard_array::ShardArray::new`]'s signature.
    pub fn new(
        config: ArrayConfig,
        sink_factory: Arc<dyn SinkFactory>,
        thread_pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        let lattice = ChunkLattice::new(Arc::clone(&config.dims));
        Ok(Self {
            config,
            lattice,
            sink_factory,
            thread_pool,
            frames_written: 0,
            append_chunk_index: 0,
            dirty: false,
        })
    }

    fn flush(&mut self) -> Result<()> {
        log::debug!(
            "v2 array {}: flushing append chunk {}",
            self.config.node_path,
            self.append_chunk_index
        );
        let buffers = self.lattice.take_and_reset();
        let inner_chunks_along = self.config.dims.inner_chunks_along().to_vec();
        let node_path = self.config.node_path.clone();
        let append_chunk_index = self.append_chunk_index;
        let compression = self.config.compression;

        for (chunk_linear, buffer) in buffers.into_iter().enumerate() {
            let inner_coords = decode_inner_index(chunk_linear as u64, &inner_chunks_along);
            let path = v2_chunk_path(&node_path, append_chunk_index, &inner_coords);
            let sink_factory = Arc::clone(&self.sink_factory);
            self.thread_pool.spawn(move || {
                let payload = match compression {
                    Some(params) => crate::codec::compress(&params, &buffer)?,
                    None => buffer,
                };
                let sink = sink_factory.create_sink(&path)?;
                sink.write(0, &payload)?;
                sink.finalize()?;
                Ok(())
            });
        }
        self.thread_pool.join_and_check()?;

        let meta = v2_array_metadata(
            &self.config.dims,
            self.config.compression.as_ref(),
            self.frames_written,
        );
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let meta_path = format!("{}/.zarray", self.config.node_path);
        let sink = self.sink_factory.create_sink(&meta_path)?;
        sink.write(0, &meta_bytes)?;
        sink.finalize()?;

        self.append_chunk_index += 1;
        self.dirty = false;
        Ok(())
    }
}

impl ArrayBehavior for ChunkArray {
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
        Ok(())
    }

    fn dims(&self) -> &ArrayDimensions {
        &self.config.dims
    }

    fn metadata_keys(&self) -> Vec<String> {
        vec![format!("{}/.zarray", self.config.node_path)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ZarrVersion;
    use crate::codec::{BloscParams, Compressor, Shuffle};
    use crate::dimension::{ArrayDimensions, DataType, Dimension, DimensionKind};
    use crate::storage::memory_sink::MemorySinkFactory;

    fn small_dims() -> Arc<ArrayDimensions> {
        Arc::new(
            ArrayDimensions::new(
                vec![
                    Dimension::new("t", DimensionKind::Time, 0, 1),
                    Dimension::new("c", DimensionKind::Channel, 2, 1),
                    Dimension::new("y", DimensionKind::Space, 4, 2),
                    Dimension::new("x", DimensionKind::Space, 4, 2),
                ],
                DataType::UInt8,
                None,
            )
            .unwrap(),
        )
    }

    fn make_array(compression: Option<BloscParams>) -> (ChunkArray, Arc<MemorySinkFactory>) {
        let dims = small_dims();
        let factory = Arc::new(MemorySinkFactory::new());
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        let config = ArrayConfig {
            node_path: "0".to_string(),
            dims,
            compression,
            version: ZarrVersion::V2,
            level_of_detail: 0,
        };
        let array = ChunkArray::new(config, factory.clone() as Arc<dyn SinkFactory>, pool).unwrap();
        (array, factory)
    }

    #[test]
    fn flush_emits_one_file_per_chunk_and_metadata() {
        let (mut array, factory) = make_array(None);
        // frames_per_flush = chunk_size_append(1) * total_middle(c=2) = 2
        let frame = vec![1u8; 16];
        array.write_frame(0, &frame).unwrap();
        array.write_frame(1, &frame).unwrap();
        let contents = factory.all_contents();
        // chunks_in_memory = c(2) * y(2) * x(2) = 8 chunk files at append index 0
        let chunk_keys: Vec<_> = contents.keys().filter(|k| k.starts_with("0/0/")).collect();
        assert_eq!(chunk_keys.len(), 8);
        assert!(contents.contains_key("0/.zarray"));
    }

    #[test]
    fn close_flushes_a_partial_chunk() {
        let (mut array, factory) = make_array(None);
        array.write_frame(0, &vec![2u8; 16]).unwrap();
        array.close().unwrap();
        let contents = factory.all_contents();
        assert!(contents.contains_key("0/.zarray"));
        assert_eq!(contents.keys().filter(|k| k.starts_with("0/0/")).count(), 8);
    }

    #[test]
    fn compressed_chunks_round_trip_through_blosc() {
        crate::codec::blosc::init();
        let params = BloscParams {
            compressor: Compressor::Lz4,
            clevel: 5,
            shuffle: Shuffle::Byte,
            type_size: 1,
        };
        let (mut array, factory) = make_array(Some(params));
        array.write_frame(0, &vec![3u8; 16]).unwrap();
        array.write_frame(1, &vec![3u8; 16]).unwrap();
        let contents = factory.all_contents();
        let chunk = contents.iter().find(|(k, _)| k.starts_with("0/0/")).unwrap().1;
        let decompressed = crate::codec::blosc::decompress(chunk).unwrap();
        assert!(decompressed.iter().all(|&b| b == 3));
    }

    #[test]
    fn mismatched_frame_size_is_not_an_error() {
        let (mut array, _factory) = make_array(None);
        let consumed = array.write_frame(0, &[0u8; 3]).unwrap();
        assert_eq!(consumed, 0);
    }
}
