//! A streaming writer for chunked, sharded and multiscale Zarr v2/v3 stores.
//!
//! This crate consumes an append-only stream of raw 2D frames and
//! materializes them into a Zarr v2 or v3 store with OME-NGFF multiscale
//! metadata, optionally downsampling into a resolution pyramid as frames
//! arrive. It has no read path: once a [`stream::Stream`] is created, this
//! crate only ever appends.
//!
//! # Overview
//!
//! - [`stream::StreamConfigBuilder`] and [`stream::ArrayConfigBuilder`] build
//!   and validate a [`stream::StreamConfig`].
//! - [`stream::Stream::create`] creates the store root and spins up the
//!   frame queue's dispatcher thread.
//! - [`stream::Stream::append`] feeds raw bytes in; [`stream::Stream::close`]
//!   (or dropping the stream) drains, finalizes every array, and writes
//!   group metadata.
//!
//! ```no_run
//! use zarr_streamer::array::ZarrVersion;
//! use zarr_streamer::dimension::{DataType, Dimension, DimensionKind};
//! use zarr_streamer::stream::{ArrayConfigBuilder, StreamConfigBuilder};
//!
//! let array = ArrayConfigBuilder::new("0", DataType::UInt16)
//!     .with_dimension(Dimension::new("t", DimensionKind::Time, 0, 1))
//!     .with_dimension(Dimension::new("y", DimensionKind::Space, 48, 16))
//!     .with_dimension(Dimension::new("x", DimensionKind::Space, 64, 16));
//! let config = StreamConfigBuilder::new_filesystem("/tmp/store.zarr", ZarrVersion::V2)
//!     .with_array(array)
//!     .build()?;
//! let mut stream = zarr_streamer::stream::Stream::create(config)?;
//! stream.append(&vec![0u8; 48 * 64 * 2], None)?;
//! stream.close()?;
//! # Ok::<(), zarr_streamer::error::StreamingError>(())
//! ```

pub mod array;
pub mod codec;
pub mod config;
pub mod dimension;
pub mod downsample;
pub mod error;
pub mod frame_queue;
pub mod group;
pub mod storage;
pub mod stream;
pub mod thread_pool;

pub use config::{global_config, global_config_mut, LogLevel, RuntimeConfig};
pub use dimension::{ArrayDimensions, DataType, Dimension, DimensionKind};
pub use downsample::DownsampleMethod;
pub use error::{Result, StreamingError};
pub use stream::{ArrayConfigBuilder, Stream, StreamConfig, StreamConfigBuilder};
