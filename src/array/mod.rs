//! Chunk- and shard-based array writers.
//!
//! An array owns one [`crate::dimension::ArrayDimensions`] model and the
//! in-memory chunk lattice [`common::ChunkLattice`] scatters frames into.
//! [`ChunkArray`](chunk_array::ChunkArray) implements the Zarr v2 on-disk
//! layout (one file per chunk); [`ShardArray`](shard_array::ShardArray)
//! implements v3 sharding (chunks packed into shard files with a trailing
//! index table and CRC32C). [`ArrayWriter`] is the closed sum type a group
//! actually holds, so callers never match on the two writers themselves.

pub mod chunk_array;
pub mod common;
pub mod shard_array;

use std::sync::Arc;

use crate::codec::BloscParams;
use crate::dimension::ArrayDimensions;
use crate::error::Result;
use crate::storage::sink::SinkFactory;
use crate::thread_pool::ThreadPool;

/// Which Zarr storage specification version an array is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZarrVersion {
    V2,
    V3,
}

/// The static configuration one array is built from.
///
/// `node_path` is the array's key relative to the store root, e.g. `"0"` for
/// a single-array group or `"0"`, `"1"`, `"2"`, ... for multiscale levels.
#[derive(Clone)]
pub struct ArrayConfig {
    pub node_path: String,
    pub dims: Arc<ArrayDimensions>,
    pub compression: Option<BloscParams>,
    pub version: ZarrVersion,
    pub level_of_detail: usize,
}

/// The capability set every concrete array writer implements.
///
/// Grounded on the original engine's `array` base class (`write_frame`,
/// `close`, metadata emission); reimplemented here as a plain trait rather
/// than the original's inheritance hierarchy (see `DESIGN.md`).
pub trait ArrayBehavior {
    /// Scatter one frame into the chunk lattice, flushing (and for shards,
    /// rolling over) whenever the lattice fills. Returns the number of bytes
    /// consumed: the full frame size, or `0` if `bytes` did not match the
    /// expected frame size (logged, not an error — see `SPEC_FULL.md` §4.8).
    ///
    /// # Errors
    /// Returns a [`crate::error::StreamingError`] if a flush job fails or a
    /// frame id addresses a chunk outside the lattice.
    fn write_frame(&mut self, frame_id: u64, bytes: &[u8]) -> Result<usize>;

    /// Flush any partially-filled chunk/shard state and write final array
    /// metadata. Called once, by the owning group, at stream close.
    ///
    /// # Errors
    /// Returns a [`crate::error::StreamingError`] if the final flush or
    /// metadata write fails.
    fn close(&mut self) -> Result<()>;

    /// The dimension model backing this array.
    fn dims(&self) -> &ArrayDimensions;

    /// The relative store keys this array's metadata lives at (e.g.
    /// `["0/.zarray"]` for v2, `["0/zarr.json"]` for v3) — used by the owning
    /// group to decide what metadata documents exist after close.
    fn metadata_keys(&self) -> Vec<String>;
}

/// The two concrete array writers, held behind one closed sum type so a
/// [`crate::group::Group`] can route frames without dynamic dispatch.
pub enum ArrayWriter {
    Chunked(chunk_array::ChunkArray),
    Sharded(shard_array::ShardArray),
}

impl ArrayWriter {
    /// Build the array writer matching `config.version`.
    ///
    /// # Errors
    /// Returns a [`crate::error::StreamingError`] if directory/sink setup for
    /// the array root fails.
    pub fn new(
        config: ArrayConfig,
        sink_factory: Arc<dyn SinkFactory>,
        thread_pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        match config.version {
            ZarrVersion::V2 => Ok(Self::Chunked(chunk_array::ChunkArray::new(
                config,
                sink_factory,
                thread_pool,
            )?)),
            ZarrVersion::V3 => Ok(Self::Sharded(shard_array::ShardArray::new(
                config,
                sink_factory,
                thread_pool,
            )?)),
        }
    }
}

impl ArrayBehavior for ArrayWriter {
    fn write_frame(&mut self, frame_id: u64, bytes: &[u8]) -> Result<usize> {
        match self {
            Self::Chunked(a) => a.write_frame(frame_id, bytes),
            Self::Sharded(a) => a.write_frame(frame_id, bytes),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Chunked(a) => a.close(),
            Self::Sharded(a) => a.close(),
        }
    }

    fn dims(&self) -> &ArrayDimensions {
        match self {
            Self::Chunked(a) => a.dims(),
            Self::Sharded(a) => a.dims(),
        }
    }

    fn metadata_keys(&self) -> Vec<String> {
        match self {
            Self::Chunked(a) => a.metadata_keys(),
            Self::Sharded(a) => a.metadata_keys(),
        }
    }
}

/// Decode a chunk-lattice linear index (over the inner, non-append axes) into
/// per-axis indices, in storage order, using each axis's chunk count.
///
/// Shared by both the v2 chunk path builder and the v3 shard-table builders
/// that need to print a chunk's coordinates.
#[must_use]
pub fn decode_inner_index(mut linear: u64, inner_chunks_along: &[u64]) -> Vec<u64> {
    let n = inner_chunks_along.len();
    let mut strides = vec![1u64; n];
    for i in (0..n.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * inner_chunks_along[i + 1].max(1);
    }
    let mut coords = vec![0u64; n];
    for i in 0..n {
        coords[i] = linear / strides[i];
        linear %= strides[i].max(1);
    }
    coords
}

/// The v2 chunk relative path: `<node_path>/<append_chunk_index>/<i1>/<i2>/.../<ik>`.
#[must_use]
pub fn v2_chunk_path(node_path: &str, append_chunk_index: u64, inner_coords: &[u64]) -> String {
    let mut parts = vec![node_path.to_string(), append_chunk_index.to_string()];
    parts.extend(inner_coords.iter().map(u64::to_string));
    parts.join("/")
}

/// The v3 shard relative path: `<node_path>/c/<append_shard_index>/<i1>/.../<ik>`,
/// with the literal `c/` segment splicing the append axis from the inner axes.
#[must_use]
pub fn v3_shard_path(node_path: &str, append_shard_index: u64, inner_coords: &[u64]) -> String {
    let mut parts = vec![
        node_path.to_string(),
        "c".to_string(),
        append_shard_index.to_string(),
    ];
    parts.extend(inner_coords.iter().map(u64::to_string));
    parts.join("/")
}

/// The v2 `.zarray` metadata document for an array at the current
/// `frames_written`, matching §6.3/§4.8.1's field list exactly.
#[must_use]
pub fn v2_array_metadata(dims: &ArrayDimensions, compression: Option<&BloscParams>, frames_written: u64) -> serde_json::Value {
    let shape = dims.shape_for_frames(frames_written);
    let chunks: Vec<u64> = dims.dims().iter().map(|d| u64::from(d.chunk_size_px)).collect();
    let compressor = compression.map_or(serde_json::Value::Null, |p| {
        serde_json::json!({
            "id": "blosc",
            "cname": match p.compressor {
                crate::codec::Compressor::Lz4 => "lz4",
                crate::codec::Compressor::Zstd => "zstd",
                crate::codec::Compressor::Zlib => "zlib",
            },
            "clevel": p.clevel,
            "shuffle": match p.shuffle {
                crate::codec::Shuffle::None => 0,
                crate::codec::Shuffle::Byte => 1,
                crate::codec::Shuffle::Bit => 2,
            },
        })
    });
    serde_json::json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": dims.data_type().v2_dtype_string(),
        "fill_value": 0,
        "order": "C",
        "filters": serde_json::Value::Null,
        "dimension_separator": "/",
        "compressor": compressor,
    })
}

/// The v3 array `zarr.json` metadata document for a chunked (non-sharded)
/// array — used only if a caller builds a v3 array with no sharding, which
/// this crate's builder does not currently expose but the format allows.
#[must_use]
pub fn v3_array_metadata_plain(dims: &ArrayDimensions, compression: Option<&BloscParams>, frames_written: u64) -> serde_json::Value {
    let shape = dims.shape_for_frames(frames_written);
    let chunk_shape: Vec<u32> = dims.dims().iter().map(|d| d.chunk_size_px).collect();
    let mut codecs = vec![serde_json::json!({"name": "bytes"})];
    if let Some(p) = compression {
        codecs.push(blosc_codec_json(p));
    }
    serde_json::json!({
        "zarr_format": 3,
        "node_type": "array",
        "shape": shape,
        "data_type": dims.data_type().v3_data_type_name(),
        "chunk_grid": {"name": "regular", "configuration": {"chunk_shape": chunk_shape}},
        "chunk_key_encoding": {"name": "default", "configuration": {"separator": "/"}},
        "fill_value": 0,
        "codecs": codecs,
        "storage_transformers": [],
        "dimension_names": dims.dims().iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
    })
}

/// The v3 array `zarr.json` metadata document for a sharded array: outer
/// chunk shape is the shard shape (`shard_size_chunks * chunk_size` per
/// axis), inner chunk shape is the chunk size, wrapped in a
/// `sharding_indexed` codec per §4.9/§6.3.
#[must_use]
pub fn v3_array_metadata_sharded(
    dims: &ArrayDimensions,
    compression: Option<&BloscParams>,
    frames_written: u64,
) -> serde_json::Value {
    let shape = dims.shape_for_frames(frames_written);
    let outer_shape: Vec<u64> = dims
        .dims()
        .iter()
        .map(|d| u64::from(d.chunk_size_px) * u64::from(d.shard_size_chunks))
        .collect();
    let inner_shape: Vec<u32> = dims.dims().iter().map(|d| d.chunk_size_px).collect();
    let mut inner_codecs = vec![serde_json::json!({"name": "bytes"})];
    if let Some(p) = compression {
        inner_codecs.push(blosc_codec_json(p));
    }
    let sharding_codec = serde_json::json!({
        "name": "sharding_indexed",
        "configuration": {
            "chunk_shape": inner_shape,
            "codecs": inner_codecs,
            "index_codecs": [{"name": "bytes"}, {"name": "crc32c"}],
            "index_location": "end",
        }
    });
    serde_json::json!({
        "zarr_format": 3,
        "node_type": "array",
        "shape": shape,
        "data_type": dims.data_type().v3_data_type_name(),
        "chunk_grid": {"name": "regular", "configuration": {"chunk_shape": outer_shape}},
        "chunk_key_encoding": {"name": "default", "configuration": {"separator": "/"}},
        "fill_value": 0,
        "codecs": [sharding_codec],
        "storage_transformers": [],
        "dimension_names": dims.dims().iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
    })
}

/// The `blosc` bytes-to-bytes codec's metadata entry.
#[must_use]
pub fn blosc_codec_json(p: &BloscParams) -> serde_json::Value {
    serde_json::json!({
        "name": "blosc",
        "configuration": {
            "cname": match p.compressor {
                crate::codec::Compressor::Lz4 => "lz4",
                crate::codec::Compressor::Zstd => "zstd",
                crate::codec::Compressor::Zlib => "zlib",
            },
            "clevel": p.clevel,
            "shuffle": match p.shuffle {
                crate::codec::Shuffle::None => "noshuffle",
                crate::codec::Shuffle::Byte => "shuffle",
                crate::codec::Shuffle::Bit => "bitshuffle",
            },
            "typesize": p.type_size,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{DataType, Dimension, DimensionKind};

    #[test]
    fn decode_inner_index_round_trips_against_encode() {
        let inner_chunks_along = vec![2u64, 3, 4];
        for linear in 0..24u64 {
            let coords = decode_inner_index(linear, &inner_chunks_along);
            let mut strides = vec![1u64; 3];
            strides[1] = inner_chunks_along[2];
            strides[0] = strides[1] * inner_chunks_along[1];
            let re_encoded: u64 = coords.iter().zip(strides.iter()).map(|(&c, &s)| c * s).sum();
            assert_eq!(re_encoded, linear);
        }
    }

    #[test]
    fn v2_chunk_path_matches_expected_layout() {
        let path = v2_chunk_path("0", 1, &[2, 0, 3, 4]);
        assert_eq!(path, "0/1/2/0/3/4");
    }

    #[test]
    fn v3_shard_path_splices_literal_c_segment() {
        let path = v3_shard_path("0", 0, &[0, 0, 0, 0]);
        assert_eq!(path, "0/c/0/0/0/0/0");
    }

    #[test]
    fn v2_metadata_matches_s1_scenario_fields() {
        let dims = ArrayDimensions::new(
            vec![
                Dimension::new("t", DimensionKind::Time, 10, 5),
                Dimension::new("c", DimensionKind::Channel, 8, 4),
                Dimension::new("z", DimensionKind::Space, 6, 2),
                Dimension::new("y", DimensionKind::Space, 48, 16),
                Dimension::new("x", DimensionKind::Space, 64, 16),
            ],
            DataType::Int32,
            None,
        )
        .unwrap();
        let meta = v2_array_metadata(&dims, None, 480);
        assert_eq!(meta["shape"], serde_json::json!([10, 8, 6, 48, 64]));
        assert_eq!(meta["chunks"], serde_json::json!([5, 4, 2, 16, 16]));
        assert_eq!(meta["dtype"], "<i4");
        assert!(meta["compressor"].is_null());
    }
}
