//! Object-store [`Sink`], backing chunk/shard/metadata keys with S3 (or any
//! other `object_store`-compatible backend).
//!
//! `object_store`'s API is `async`; this crate's [`Sink`] trait is
//! synchronous, so every call is dispatched onto a small shared
//! [`tokio::runtime::Runtime`] via `block_on`. Bytes are buffered in memory
//! until [`Sink::finalize`], then written as a single `PUT` below the
//! multipart threshold or streamed as a multipart upload above it — mirroring
//! the original engine's connection-pooled S3 client, minus connection
//! pooling itself (handled internally by `object_store`'s HTTP client).

use std::sync::{Mutex, OnceLock};

use bytes::Bytes;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use parking_lot::RwLock;

use crate::error::{Result, StreamingError};
use crate::storage::sink::{Sink, SinkFactory, SinkState};

/// Build an S3-backed [`ObjectStoreSinkFactory`] and probe the bucket with a
/// test connection, failing fast rather than discovering a bad endpoint on
/// the first chunk write.
///
/// # Errors
/// Returns [`StreamingError::ObjectStore`] if the client cannot be built or
/// the probe request fails.
pub fn build_and_probe(
    bucket: &str,
    endpoint: &str,
    region: &str,
    prefix: &str,
) -> Result<std::sync::Arc<dyn SinkFactory>> {
    let store = object_store::aws::AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_endpoint(endpoint)
        .with_region(region)
        .with_allow_http(true)
        .build()?;
    let store: std::sync::Arc<dyn ObjectStore> = std::sync::Arc::new(store);
    let probe_store = std::sync::Arc::clone(&store);
    runtime().block_on(async move {
        probe_store.list_with_delimiter(None).await?;
        Ok::<(), object_store::Error>(())
    })?;
    Ok(std::sync::Arc::new(ObjectStoreSinkFactory::new(
        store,
        StorePath::from(prefix),
    )))
}

/// Above this size, uploads go through `object_store`'s multipart API instead
/// of a single `PUT`.
pub const MULTIPART_THRESHOLD_BYTES: usize = 5 * 1024 * 1024;

/// Chunk size used for each part of a multipart upload.
const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("zarr-streamer-s3")
            .enable_all()
            .build()
            .expect("failed to start the object-store runtime")
    })
}

/// A [`Sink`] that accumulates one key's bytes in memory and uploads them to
/// an `object_store` backend on [`Sink::finalize`].
pub struct ObjectStoreSink {
    store: std::sync::Arc<dyn ObjectStore>,
    key: StorePath,
    buffer: Mutex<Vec<u8>>,
    state: RwLock<SinkState>,
}

impl ObjectStoreSink {
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn ObjectStore>, key: StorePath) -> Self {
        Self {
            store,
            key,
            buffer: Mutex::new(Vec::new()),
            state: RwLock::new(SinkState::Open),
        }
    }
}

impl Sink for ObjectStoreSink {
    fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == SinkState::Finalized {
                return Err(StreamingError::Internal(
                    "write after finalize".to_string(),
                ));
            }
            *state = SinkState::Writing;
        }
        let mut buffer = self.buffer.lock().unwrap();
        let end = offset as usize + bytes.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state == SinkState::Finalized {
            return Ok(());
        }
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());
        let store = std::sync::Arc::clone(&self.store);
        let key = self.key.clone();
        runtime().block_on(async move {
            if buffer.len() <= MULTIPART_THRESHOLD_BYTES {
                store.put(&key, Bytes::from(buffer)).await?;
            } else {
                use tokio::io::AsyncWriteExt;
                let (_id, mut writer) = store.put_multipart(&key).await?;
                for chunk in buffer.chunks(MULTIPART_PART_SIZE) {
                    writer.write_all(chunk).await?;
                }
                writer.shutdown().await?;
            }
            Ok::<(), object_store::Error>(())
        })?;
        *state = SinkState::Finalized;
        Ok(())
    }

    fn state(&self) -> SinkState {
        *self.state.read()
    }
}

/// Creates [`ObjectStoreSink`]s under one bucket/prefix, sharing the
/// underlying `object_store` client.
pub struct ObjectStoreSinkFactory {
    store: std::sync::Arc<dyn ObjectStore>,
    prefix: StorePath,
}

impl ObjectStoreSinkFactory {
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn ObjectStore>, prefix: StorePath) -> Self {
        Self { store, prefix }
    }
}

impl SinkFactory for ObjectStoreSinkFactory {
    fn create_sink(&self, relative_path: &str) -> Result<std::sync::Arc<dyn Sink>> {
        let key = self.prefix.parts().chain(StorePath::from(relative_path).parts()).collect::<StorePath>();
        Ok(std::sync::Arc::new(ObjectStoreSink::new(
            std::sync::Arc::clone(&self.store),
            key,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[test]
    fn small_write_goes_through_single_put() {
        let store: std::sync::Arc<dyn ObjectStore> = std::sync::Arc::new(InMemory::new());
        let key = StorePath::from("a/b/0.0");
        let sink = ObjectStoreSink::new(std::sync::Arc::clone(&store), key.clone());
        sink.write(0, b"hello").unwrap();
        sink.finalize().unwrap();
        let read = runtime().block_on(async { store.get(&key).await.unwrap().bytes().await.unwrap() });
        assert_eq!(&read[..], b"hello");
    }

    #[test]
    fn large_write_goes_through_multipart() {
        let store: std::sync::Arc<dyn ObjectStore> = std::sync::Arc::new(InMemory::new());
        let key = StorePath::from("big.bin");
        let sink = ObjectStoreSink::new(std::sync::Arc::clone(&store), key.clone());
        let payload = vec![7u8; MULTIPART_THRESHOLD_BYTES + 1024];
        sink.write(0, &payload).unwrap();
        sink.finalize().unwrap();
        let read = runtime().block_on(async { store.get(&key).await.unwrap().bytes().await.unwrap() });
        assert_eq!(read.len(), payload.len());
    }

    #[test]
    fn write_after_finalize_errors() {
        let store: std::sync::Arc<dyn ObjectStore> = std::sync::Arc::new(InMemory::new());
        let sink = ObjectStoreSink::new(store, StorePath::from("x"));
        sink.write(0, b"a").unwrap();
        sink.finalize().unwrap();
        assert!(sink.write(0, b"b").is_err());
    }
}
