//! The stream coordinator (C12): the crate's single public entry point.
//!
//! Validates a [`StreamConfig`], creates the store root, owns the frame
//! queue and its dispatcher thread, and routes appended bytes to the right
//! [`crate::group::Group`] by array key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::array::ZarrVersion;
use crate::codec::BloscParams;
use crate::config::global_config;
use crate::dimension::{ArrayDimensions, DataType, Dimension};
use crate::downsample::DownsampleMethod;
use crate::error::{Result, StreamingError};
use crate::frame_queue::{Frame, FrameQueue};
use crate::group::{Group, GroupConfig};
use crate::storage::fs_sink::FsSinkFactory;
use crate::storage::sink::SinkFactory;
use crate::thread_pool::ThreadPool;

/// The default array key used when a single-array stream's caller never
/// passes one to [`Stream::append`].
const DEFAULT_ARRAY_KEY: &str = "0";

/// Where the store's bytes actually land.
pub enum StoreBackend {
    FileSystem { root: PathBuf },
    #[cfg(feature = "s3")]
    S3 {
        bucket: String,
        endpoint: String,
        region: String,
        prefix: String,
    },
}

/// Per-array configuration, built into a [`GroupConfig`] at [`Stream::create`].
pub struct ArrayConfigBuilder {
    key: String,
    dims: Vec<Dimension>,
    data_type: DataType,
    storage_order: Option<Vec<usize>>,
    compression: Option<BloscParams>,
    multiscale: bool,
    downsampling_method: Option<DownsampleMethod>,
}

impl ArrayConfigBuilder {
    #[must_use]
    pub fn new(key: impl Into<String>, data_type: DataType) -> Self {
        Self {
            key: key.into(),
            dims: Vec::new(),
            data_type,
            storage_order: None,
            compression: None,
            multiscale: false,
            downsampling_method: None,
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, dim: Dimension) -> Self {
        self.dims.push(dim);
        self
    }

    #[must_use]
    pub fn with_storage_order(mut self, order: Vec<usize>) -> Self {
        self.storage_order = Some(order);
        self
    }

    #[must_use]
    pub fn with_compression(mut self, params: BloscParams) -> Self {
        self.compression = Some(params);
        self
    }

    #[must_use]
    pub fn with_multiscale(mut self, method: DownsampleMethod) -> Self {
        self.multiscale = true;
        self.downsampling_method = Some(method);
        self
    }

    fn build_dims(&self) -> Result<Arc<ArrayDimensions>> {
        Ok(Arc::new(ArrayDimensions::new(
            self.dims.clone(),
            self.data_type,
            self.storage_order.clone(),
        )?))
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(StreamingError::InvalidArgument(
                "array key must not be empty".to_string(),
            ));
        }
        if let Some(params) = &self.compression {
            params.validate()?;
        }
        self.build_dims()?;
        Ok(())
    }
}

/// Top-level configuration for one stream, validated and consumed by
/// [`Stream::create`].
pub struct StreamConfig {
    backend: StoreBackend,
    version: ZarrVersion,
    overwrite: bool,
    arrays: Vec<ArrayConfigBuilder>,
    thread_pool_size: Option<usize>,
    handle_pool_capacity: usize,
}

/// Builder for [`StreamConfig`], following the fluent `with_*` style used
/// throughout this crate's own config types (see [`crate::dimension::Dimension`]).
pub struct StreamConfigBuilder {
    backend: StoreBackend,
    version: ZarrVersion,
    overwrite: bool,
    arrays: Vec<ArrayConfigBuilder>,
    thread_pool_size: Option<usize>,
    handle_pool_capacity: usize,
}

impl StreamConfigBuilder {
    #[must_use]
    pub fn new_filesystem(root: impl Into<PathBuf>, version: ZarrVersion) -> Self {
        Self {
            backend: StoreBackend::FileSystem { root: root.into() },
            version,
            overwrite: false,
            arrays: Vec::new(),
            thread_pool_size: None,
            handle_pool_capacity: crate::storage::fs_sink::DEFAULT_HANDLE_POOL_CAPACITY,
        }
    }

    #[cfg(feature = "s3")]
    #[must_use]
    pub fn new_s3(
        bucket: impl Into<String>,
        endpoint: impl Into<String>,
        region: impl Into<String>,
        prefix: impl Into<String>,
        version: ZarrVersion,
    ) -> Self {
        Self {
            backend: StoreBackend::S3 {
                bucket: bucket.into(),
                endpoint: endpoint.into(),
                region: region.into(),
                prefix: prefix.into(),
            },
            version,
            overwrite: false,
            arrays: Vec::new(),
            thread_pool_size: None,
            handle_pool_capacity: crate::storage::fs_sink::DEFAULT_HANDLE_POOL_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    #[must_use]
    pub fn with_array(mut self, array: ArrayConfigBuilder) -> Self {
        self.arrays.push(array);
        self
    }

    #[must_use]
    pub fn with_thread_pool_size(mut self, num_threads: usize) -> Self {
        self.thread_pool_size = Some(num_threads);
        self
    }

    #[must_use]
    pub fn with_handle_pool_capacity(mut self, capacity: usize) -> Self {
        self.handle_pool_capacity = capacity;
        self
    }

    /// Validate and freeze this builder into a [`StreamConfig`].
    ///
    /// # Errors
    /// Returns [`StreamingError::InvalidArgument`] or
    /// [`StreamingError::InvalidSettings`] on any of the rejections listed in
    /// `SPEC_FULL.md` §4.12's config validation rules.
    pub fn build(self) -> Result<StreamConfig> {
        match &self.backend {
            StoreBackend::FileSystem { root } => {
                if root.as_os_str().is_empty() {
                    return Err(StreamingError::InvalidArgument(
                        "store path must not be empty".to_string(),
                    ));
                }
            }
            #[cfg(feature = "s3")]
            StoreBackend::S3 { bucket, endpoint, .. } => {
                if endpoint.is_empty() {
                    return Err(StreamingError::InvalidArgument(
                        "S3 endpoint must not be empty".to_string(),
                    ));
                }
                if !(3..=63).contains(&bucket.len()) {
                    return Err(StreamingError::InvalidArgument(format!(
                        "S3 bucket name length must be in [3, 63], got {}",
                        bucket.len()
                    )));
                }
            }
        }
        if self.arrays.is_empty() {
            return Err(StreamingError::InvalidArgument(
                "stream must configure at least one array".to_string(),
            ));
        }
        let mut seen_keys = std::collections::HashSet::new();
        for array in &self.arrays {
            array.validate()?;
            if !seen_keys.insert(array.key.clone()) {
                return Err(StreamingError::InvalidArgument(format!(
                    "duplicate array key {:?}",
                    array.key
                )));
            }
        }
        Ok(StreamConfig {
            backend: self.backend,
            version: self.version,
            overwrite: self.overwrite,
            arrays: self.arrays,
            thread_pool_size: self.thread_pool_size,
            handle_pool_capacity: self.handle_pool_capacity,
        })
    }
}

impl StreamConfig {
    /// Upper bound on the working-set memory this stream will use once
    /// created: 1 GiB for the frame queue, plus per array the chunk
    /// lattice's full buffer size (doubled if compressed, doubled again if
    /// multiscale) plus one frame's worth of partial-buffer bytes.
    ///
    /// Pure and callable before [`Stream::create`] — builds each array's
    /// dimension model but performs no I/O.
    ///
    /// # Errors
    /// Returns a [`StreamingError`] if any array's dimension list is invalid.
    pub fn estimate_max_memory_usage(&self) -> Result<usize> {
        const QUEUE_BUDGET_BYTES: usize = 1024 * 1024 * 1024;
        let mut total = QUEUE_BUDGET_BYTES;
        for array in &self.arrays {
            let dims = array.build_dims()?;
            let lattice_bytes = (dims.bytes_per_chunk() * dims.chunks_in_memory()) as usize;
            let compressed_factor = if array.compression.is_some() { 2 } else { 1 };
            let multiscale_factor = if array.multiscale { 2 } else { 1 };
            total += lattice_bytes * compressed_factor * multiscale_factor;
            total += dims.bytes_per_frame() as usize;
        }
        Ok(total)
    }
}

/// Lifecycle of the stream coordinator (§4.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Running,
    Draining,
    Closed,
}

/// The crate's public entry point: accepts raw 2D frame bytes and
/// materializes them into a Zarr store.
pub struct Stream {
    groups: Arc<Mutex<HashMap<String, Group>>>,
    queue: Arc<FrameQueue>,
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_failed: Arc<AtomicBool>,
    dispatcher_error: Arc<Mutex<Option<StreamingError>>>,
    partial_buffers: Mutex<HashMap<String, (Vec<u8>, usize)>>,
    frame_size_bytes: HashMap<String, u64>,
    sink_factory: Arc<dyn SinkFactory>,
    /// Set once `write_custom_metadata` succeeds, so a second call without
    /// `overwrite` is rejected uniformly across backends. A filesystem `stat`
    /// on the would-be `acquire.json` path cannot do this: the object-store
    /// backend has no local path to stat (§4.4), so this tracks the write
    /// through the stream itself rather than querying the sink's backend.
    custom_metadata_written: AtomicBool,
    state: Mutex<StreamState>,
}

impl Stream {
    /// Validate `config`, create the store root, and spin up the frame
    /// queue's dispatcher thread.
    ///
    /// # Errors
    /// Returns a [`StreamingError`] if store creation or any array's setup
    /// fails.
    pub fn create(config: StreamConfig) -> Result<Self> {
        let sink_factory: Arc<dyn SinkFactory> = match &config.backend {
            StoreBackend::FileSystem { root } => {
                if config.overwrite && root.exists() {
                    std::fs::remove_dir_all(root)?;
                }
                std::fs::create_dir_all(root)?;
                Arc::new(FsSinkFactory::new(root.clone(), config.handle_pool_capacity))
            }
            #[cfg(feature = "s3")]
            StoreBackend::S3 {
                bucket,
                endpoint,
                region,
                prefix,
            } => crate::storage::s3_sink::build_and_probe(bucket, endpoint, region, prefix)?,
        };

        let thread_pool = Arc::new(ThreadPool::new(
            config
                .thread_pool_size
                .unwrap_or_else(|| global_config().default_concurrency()),
        )?);

        let mut groups = HashMap::new();
        let mut frame_size_bytes = HashMap::new();
        for array in &config.arrays {
            let dims = array.build_dims()?;
            frame_size_bytes.insert(array.key.clone(), dims.bytes_per_frame());
            let group_config = GroupConfig {
                dims,
                compression: array.compression,
                version: config.version,
                multiscale: array.multiscale,
                downsampling_method: array.downsampling_method,
            };
            let group = Group::new(group_config, Arc::clone(&sink_factory), Arc::clone(&thread_pool))?;
            groups.insert(array.key.clone(), group);
        }

        let max_frame_size = frame_size_bytes.values().copied().max().unwrap_or(1);
        let queue = Arc::new(FrameQueue::new(max_frame_size));
        let groups = Arc::new(Mutex::new(groups));
        let dispatcher_failed = Arc::new(AtomicBool::new(false));
        let dispatcher_error = Arc::new(Mutex::new(None));

        let dispatcher = {
            let queue = Arc::clone(&queue);
            let groups = Arc::clone(&groups);
            let failed = Arc::clone(&dispatcher_failed);
            let error_slot = Arc::clone(&dispatcher_error);
            std::thread::Builder::new()
                .name("zarr-streamer-dispatcher".to_string())
                .spawn(move || {
                    while let Some(frame) = queue.pop() {
                        let mut groups = groups.lock().unwrap();
                        let Some(group) = groups.get_mut(&frame.array_key) else {
                            log::error!("dispatcher: unknown array key {:?}", frame.array_key);
                            continue;
                        };
                        if let Err(err) = group.write_frame(&frame.bytes) {
                            log::error!("dispatcher: write_frame failed: {err}");
                            failed.store(true, Ordering::SeqCst);
                            *error_slot.lock().unwrap() = Some(err);
                        }
                    }
                })
                .expect("failed to spawn dispatcher thread")
        };

        Ok(Self {
            groups,
            queue,
            dispatcher: Some(dispatcher),
            dispatcher_failed,
            dispatcher_error,
            partial_buffers: Mutex::new(HashMap::new()),
            frame_size_bytes,
            sink_factory,
            custom_metadata_written: AtomicBool::new(false),
            state: Mutex::new(StreamState::Running),
        })
    }

    fn check_dispatcher_error(&self) -> Result<()> {
        if self.dispatcher_failed.load(Ordering::SeqCst) {
            if let Some(err) = self.dispatcher_error.lock().unwrap().take() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Append raw bytes to `array_key`'s frame stream (or the single
    /// configured array, if `array_key` is `None`), splitting the input into
    /// whole frames per §4.12.1 and buffering any remainder.
    ///
    /// # Errors
    /// Returns [`StreamingError::InvalidArgument`] for an unknown array key,
    /// or any error surfaced by a prior background flush failure.
    pub fn append(&self, bytes: &[u8], array_key: Option<&str>) -> Result<usize> {
        self.check_dispatcher_error()?;
        let key = array_key.unwrap_or(DEFAULT_ARRAY_KEY).to_string();
        let frame_size = *self
            .frame_size_bytes
            .get(&key)
            .ok_or_else(|| StreamingError::InvalidArgument(format!("unknown array key {key:?}")))?
            as usize;

        let mut partials = self.partial_buffers.lock().unwrap();
        let (buffer, offset) = partials
            .entry(key.clone())
            .or_insert_with(|| (vec![0u8; frame_size], 0));

        let mut consumed = 0usize;
        let mut remaining = bytes;

        if *offset > 0 {
            let remaining_in_frame = frame_size - *offset;
            if remaining.len() < remaining_in_frame {
                buffer[*offset..*offset + remaining.len()].copy_from_slice(remaining);
                *offset += remaining.len();
                return Ok(bytes.len());
            }
            buffer[*offset..frame_size].copy_from_slice(&remaining[..remaining_in_frame]);
            self.queue.push(Frame {
                array_key: key.clone(),
                bytes: buffer.clone(),
            });
            consumed += remaining_in_frame;
            remaining = &remaining[remaining_in_frame..];
            *offset = 0;
        }

        while remaining.len() >= frame_size {
            self.queue.push(Frame {
                array_key: key.clone(),
                bytes: remaining[..frame_size].to_vec(),
            });
            consumed += frame_size;
            remaining = &remaining[frame_size..];
        }

        if !remaining.is_empty() {
            buffer[..remaining.len()].copy_from_slice(remaining);
            *offset = remaining.len();
            consumed += remaining.len();
        }

        Ok(consumed)
    }

    /// Write (or replace) the `acquire.json` custom metadata document at the
    /// store root.
    ///
    /// # Errors
    /// Returns [`StreamingError::WillNotOverwrite`] if the document already
    /// exists and `overwrite` is `false`, or [`StreamingError::Metadata`] if
    /// `json` does not round-trip through `serde_json`.
    pub fn write_custom_metadata(&self, json: &str, overwrite: bool) -> Result<()> {
        let parsed: serde_json::Value = serde_json::from_str(json)?;
        if !overwrite && self.custom_metadata_written.load(Ordering::SeqCst) {
            return Err(StreamingError::WillNotOverwrite);
        }
        let bytes = serde_json::to_vec_pretty(&parsed)?;
        let sink = self.sink_factory.create_sink("acquire.json")?;
        sink.write(0, &bytes)?;
        sink.finalize()?;
        self.custom_metadata_written.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Frames currently buffered in the queue and in per-array partial
    /// buffers, in bytes. An instantaneous snapshot, not a peak.
    #[must_use]
    pub fn current_memory_usage(&self) -> usize {
        let queued_frames = self.queue.len();
        let avg_frame_size = self.frame_size_bytes.values().copied().max().unwrap_or(0) as usize;
        let partials_bytes: usize = self
            .partial_buffers
            .lock()
            .unwrap()
            .values()
            .map(|(buf, _)| buf.len())
            .sum();
        queued_frames * avg_frame_size + partials_bytes
    }

    /// Drain the queue, join the dispatcher, close every array and write
    /// group metadata. Idempotent: calling `close` after a prior successful
    /// close is a no-op.
    ///
    /// # Errors
    /// Returns the first error encountered while draining or closing.
    pub fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state == StreamState::Closed {
            return Ok(());
        }
        *state = StreamState::Draining;
        drop(state);

        self.queue.finish();
        if let Some(handle) = self.dispatcher.take() {
            handle.join().expect("dispatcher thread panicked");
        }
        self.check_dispatcher_error()?;

        let mut groups = self.groups.lock().unwrap();
        let mut first_err = None;
        for group in groups.values_mut() {
            if let Err(err) = group.close() {
                log::error!("group close failed: {err}");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        drop(groups);

        *self.state.lock().unwrap() = StreamState::Closed;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("error finalizing stream on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKind;

    fn small_builder(root: &std::path::Path) -> StreamConfigBuilder {
        let array = ArrayConfigBuilder::new(DEFAULT_ARRAY_KEY, DataType::UInt8)
            .with_dimension(Dimension::new("t", DimensionKind::Time, 0, 1))
            .with_dimension(Dimension::new("y", DimensionKind::Space, 4, 4))
            .with_dimension(Dimension::new("x", DimensionKind::Space, 4, 4));
        StreamConfigBuilder::new_filesystem(root, ZarrVersion::V2).with_array(array)
    }

    #[test]
    fn append_splits_and_enqueues_whole_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_builder(dir.path()).build().unwrap();
        let mut stream = Stream::create(config).unwrap();
        let consumed = stream.append(&vec![1u8; 16], None).unwrap();
        assert_eq!(consumed, 16);
        stream.close().unwrap();
        assert!(dir.path().join(".zgroup").exists());
        assert!(dir.path().join("0/.zarray").exists());
    }

    #[test]
    fn append_buffers_a_partial_frame_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_builder(dir.path()).build().unwrap();
        let mut stream = Stream::create(config).unwrap();
        stream.append(&vec![1u8; 10], None).unwrap();
        stream.append(&vec![2u8; 6], None).unwrap();
        stream.close().unwrap();
        assert!(dir.path().join("0/0/0/0").exists());
    }

    #[test]
    fn unknown_array_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_builder(dir.path()).build().unwrap();
        let stream = Stream::create(config).unwrap();
        assert!(stream.append(&[1, 2, 3], Some("nope")).is_err());
    }

    #[test]
    fn custom_metadata_refuses_second_write_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_builder(dir.path()).build().unwrap();
        let stream = Stream::create(config).unwrap();
        stream.write_custom_metadata(r#"{"a":1}"#, false).unwrap();
        assert!(matches!(
            stream.write_custom_metadata(r#"{"a":2}"#, false),
            Err(StreamingError::WillNotOverwrite)
        ));
        stream.write_custom_metadata(r#"{"a":2}"#, true).unwrap();
    }

    #[test]
    fn empty_store_path_is_rejected() {
        let result = StreamConfigBuilder::new_filesystem("", ZarrVersion::V2)
            .with_array(ArrayConfigBuilder::new("0", DataType::UInt8))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn estimate_max_memory_usage_is_at_least_the_queue_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_builder(dir.path()).build().unwrap();
        let estimate = config.estimate_max_memory_usage().unwrap();
        assert!(estimate >= 1024 * 1024 * 1024);
    }
}
