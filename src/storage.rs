//! Storage backends: a [`sink::Sink`] trait implemented by the filesystem,
//! an S3-compatible object store, and an in-memory backend used by tests.
//!
//! Unlike a general-purpose Zarr store, a [`sink::Sink`] only ever appends —
//! there is no read path here, since the streaming writer never re-reads
//! what it has written.

pub mod fs_sink;
pub mod memory_sink;
pub mod sink;

#[cfg(feature = "s3")]
pub mod s3_sink;

pub use fs_sink::{FileSink, HandlePool, DEFAULT_HANDLE_POOL_CAPACITY};
pub use memory_sink::MemorySink;
pub use sink::{Sink, SinkState};

#[cfg(feature = "s3")]
pub use s3_sink::ObjectStoreSink;
