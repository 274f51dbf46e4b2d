//! Compression codecs available to array writers.
//!
//! Only one family is supported: Blosc1. The v3 sharding codec pipeline also
//! names a `bytes` codec and, for the shard index, `bytes` + `crc32c` — those
//! are metadata-only identifiers (see [`crate::group::metadata`]) and have no
//! runtime counterpart here since this crate never decodes.

pub mod blosc;

pub use blosc::{compress, BloscParams, Compressor, Shuffle};
