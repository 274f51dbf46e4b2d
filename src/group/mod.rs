//! The group / multiscale writer (C11): owns the array(s) of one Zarr
//! group — a single array if not multiscale, or `L+1` arrays (one per
//! pyramid level) when multiscale — and routes incoming frames through the
//! downsampler into every derived level.

pub mod metadata;

use std::collections::HashMap;
use std::sync::Arc;

use crate::array::{ArrayBehavior, ArrayConfig, ArrayWriter, ZarrVersion};
use crate::codec::BloscParams;
use crate::dimension::ArrayDimensions;
use crate::downsample::{DownsampleMethod, Downsampler};
use crate::error::Result;
use crate::storage::sink::SinkFactory;
use crate::thread_pool::ThreadPool;

/// Configuration for one group: a base array's dimensions plus whether (and
/// how) to derive a multiscale pyramid from it (§3, `GroupConfig`).
pub struct GroupConfig {
    pub dims: Arc<ArrayDimensions>,
    pub compression: Option<BloscParams>,
    pub version: ZarrVersion,
    pub multiscale: bool,
    pub downsampling_method: Option<DownsampleMethod>,
}

pub struct Group {
    base_dims: Arc<ArrayDimensions>,
    compression: Option<BloscParams>,
    version: ZarrVersion,
    /// Level-of-detail 0 is always present; entries `1..` exist only when
    /// `downsampler` is `Some`.
    arrays: HashMap<String, ArrayWriter>,
    /// Per-array frame counters, independent of the base array's frame ids:
    /// each derived level receives fewer frames than the base (the
    /// downsampler halves the rate along any axis it pairs over), so every
    /// array tracks its own monotonic sequence rather than reusing the
    /// base's frame id.
    frame_counters: HashMap<String, u64>,
    downsampler: Option<Downsampler>,
    downsampling_method: Option<DownsampleMethod>,
    sink_factory: Arc<dyn SinkFactory>,
    closed: bool,
}

impl Group {
    /// # Errors
    /// Returns a [`crate::error::StreamingError`] if pyramid construction or
    /// any array's setup fails.
    pub fn new(config: GroupConfig, sink_factory: Arc<dyn SinkFactory>, thread_pool: Arc<ThreadPool>) -> Result<Self> {
        let mut arrays = HashMap::new();
        let mut frame_counters = HashMap::new();

        let base_config = ArrayConfig {
            node_path: "0".to_string(),
            dims: Arc::clone(&config.dims),
            compression: config.compression,
            version: config.version,
            level_of_detail: 0,
        };
        arrays.insert(
            "0".to_string(),
            ArrayWriter::new(base_config, Arc::clone(&sink_factory), Arc::clone(&thread_pool))?,
        );
        frame_counters.insert("0".to_string(), 0u64);

        let downsampler = if config.multiscale {
            let method = config
                .downsampling_method
                .unwrap_or(DownsampleMethod::Mean);
            let ds = Downsampler::new(&config.dims, method)?;
            for level in 1..=ds.level_count() {
                let level_config = ArrayConfig {
                    node_path: level.to_string(),
                    dims: Arc::clone(ds.level_dims(level)),
                    compression: config.compression,
                    version: config.version,
                    level_of_detail: level,
                };
                arrays.insert(
                    level.to_string(),
                    ArrayWriter::new(level_config, Arc::clone(&sink_factory), Arc::clone(&thread_pool))?,
                );
                frame_counters.insert(level.to_string(), 0u64);
            }
            Some(ds)
        } else {
            None
        };

        Ok(Self {
            base_dims: config.dims,
            compression: config.compression,
            version: config.version,
            arrays,
            frame_counters,
            downsampler,
            downsampling_method: config.downsampling_method,
            sink_factory,
            closed: false,
        })
    }

    /// Route one raw frame into the level-0 array, then (when multiscale)
    /// feed it through the downsampler and drain any level outputs that
    /// became ready as a result.
    ///
    /// # Errors
    /// Propagates the underlying array writer's errors.
    pub fn write_frame(&mut self, bytes: &[u8]) -> Result<usize> {
        let base_frame_id = *self.frame_counters.get("0").unwrap();
        let consumed = self
            .arrays
            .get_mut("0")
            .expect("level-0 array always exists")
            .write_frame(base_frame_id, bytes)?;
        if consumed == 0 {
            return Ok(0);
        }
        *self.frame_counters.get_mut("0").unwrap() += 1;

        if let Some(downsampler) = &mut self.downsampler {
            let n = self.base_dims.ndims();
            let height = self.base_dims.at(n - 2).array_size_px;
            let width = self.base_dims.at(n - 1).array_size_px;
            downsampler.add_frame(width, height, bytes);
            for level in 1..=downsampler.level_count() {
                if let Some(level_bytes) = downsampler.take(level) {
                    let key = level.to_string();
                    let frame_id = *self.frame_counters.get(&key).unwrap();
                    self.arrays
                        .get_mut(&key)
                        .expect("pyramid level array exists for every downsampler level")
                        .write_frame(frame_id, &level_bytes)?;
                    *self.frame_counters.get_mut(&key).unwrap() += 1;
                }
            }
        }
        Ok(consumed)
    }

    /// Close every array, then write group metadata (`.zgroup`/`.zattrs` for
    /// v2, `zarr.json` for v3) including OME multiscales if configured.
    ///
    /// # Errors
    /// Propagates array close errors or metadata sink errors.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for array in self.arrays.values_mut() {
            array.close()?;
        }
        self.write_group_metadata()?;
        self.closed = true;
        Ok(())
    }

    fn level_dims(&self) -> Vec<Arc<ArrayDimensions>> {
        match &self.downsampler {
            Some(ds) => (1..=ds.level_count()).map(|l| Arc::clone(ds.level_dims(l))).collect(),
            None => Vec::new(),
        }
    }

    fn write_group_metadata(&self) -> Result<()> {
        let method = self.downsampling_method.unwrap_or(DownsampleMethod::Mean);
        let levels = self.level_dims();
        match self.version {
            ZarrVersion::V2 => {
                let zgroup = serde_json::to_vec_pretty(&metadata::v2_group_json())?;
                let sink = self.sink_factory.create_sink(".zgroup")?;
                sink.write(0, &zgroup)?;
                sink.finalize()?;

                let zattrs = serde_json::to_vec_pretty(&metadata::v2_attrs_json(&self.base_dims, &levels, method))?;
                let sink = self.sink_factory.create_sink(".zattrs")?;
                sink.write(0, &zattrs)?;
                sink.finalize()?;
            }
            ZarrVersion::V3 => {
                let zarr_json = serde_json::to_vec_pretty(&metadata::v3_group_json(Some(&self.base_dims), &levels, method))?;
                let sink = self.sink_factory.create_sink("zarr.json")?;
                sink.write(0, &zarr_json)?;
                sink.finalize()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{DataType, Dimension, DimensionKind};
    use crate::storage::memory_sink::MemorySinkFactory;

    fn dims() -> Arc<ArrayDimensions> {
        Arc::new(
            ArrayDimensions::new(
                vec![
                    Dimension::new("t", DimensionKind::Time, 0, 1),
                    Dimension::new("y", DimensionKind::Space, 8, 4),
                    Dimension::new("x", DimensionKind::Space, 8, 4),
                ],
                DataType::UInt8,
                None,
            )
            .unwrap(),
        )
    }

    fn make_group(multiscale: bool) -> (Group, Arc<MemorySinkFactory>) {
        let factory = Arc::new(MemorySinkFactory::new());
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        let config = GroupConfig {
            dims: dims(),
            compression: None,
            version: ZarrVersion::V2,
            multiscale,
            downsampling_method: Some(DownsampleMethod::Mean),
        };
        let group = Group::new(config, factory.clone() as Arc<dyn SinkFactory>, pool).unwrap();
        (group, factory)
    }

    #[test]
    fn non_multiscale_group_only_has_a_level0_array() {
        let (mut group, factory) = make_group(false);
        group.write_frame(&vec![1u8; 16]).unwrap();
        group.close().unwrap();
        let contents = factory.all_contents();
        assert!(contents.contains_key(".zgroup"));
        assert!(contents.contains_key(".zattrs"));
        assert!(contents.keys().any(|k| k.starts_with("0/0/")));
        assert!(!contents.keys().any(|k| k.starts_with("1/")));
    }

    #[test]
    fn multiscale_group_feeds_derived_levels() {
        let (mut group, factory) = make_group(true);
        group.write_frame(&vec![3u8; 16]).unwrap();
        group.close().unwrap();
        let contents = factory.all_contents();
        let multiscales = &contents[".zattrs"];
        let parsed: serde_json::Value = serde_json::from_slice(multiscales).unwrap();
        let datasets = parsed["multiscales"][0]["datasets"].as_array().unwrap();
        assert!(datasets.len() >= 2);
        assert!(contents.keys().any(|k| k.starts_with("1/0/")));
    }
}
