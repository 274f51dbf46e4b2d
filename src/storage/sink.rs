//! The [`Sink`] trait: the one extension point every storage backend
//! implements, plus the path-construction helpers shared by the filesystem
//! and object-store backends.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Lifecycle of a [`Sink`]. A sink starts `Open`, accepts any number of
/// `write` calls while `Writing`, and becomes `Finalized` exactly once —
/// after which further writes are a programmer error, not a runtime one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Open,
    Writing,
    Finalized,
}

/// A write destination for one data key (chunk, shard, or metadata document).
///
/// Implementations must be safe to share across worker threads: the thread
/// pool dispatches writes for independent chunks/shards concurrently, with no
/// ordering guarantee beyond "writes to the same key from the same producer
/// are not reordered by this crate".
pub trait Sink: Send + Sync {
    /// Write `bytes` at `offset` within this sink's key. Filesystem sinks
    /// seek-and-write; object-store sinks buffer and flush at
    /// [`Self::finalize`] (or mid-stream once a multipart threshold is
    /// crossed).
    ///
    /// # Errors
    /// Returns [`crate::error::StreamingError::Io`] or
    /// [`crate::error::StreamingError::ObjectStore`] on a backend failure.
    fn write(&self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Flush and close the sink. Idempotent: calling `finalize` twice is a
    /// no-op the second time.
    ///
    /// # Errors
    /// Returns a backend error if the final flush fails.
    fn finalize(&self) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> SinkState;
}

/// Opens a fresh [`Sink`] for one relative key path. Array and group writers
/// never talk to a filesystem path or object-store client directly — they
/// go through a `SinkFactory`, so the same writer code runs unmodified
/// against any backend.
pub trait SinkFactory: Send + Sync {
    /// Open a sink for `relative_path` (store-relative, `/`-separated).
    ///
    /// # Errors
    /// Returns a backend error if the sink cannot be opened (e.g. the
    /// filesystem backend's directory creation fails).
    fn create_sink(&self, relative_path: &str) -> Result<std::sync::Arc<dyn Sink>>;
}

/// Build the on-disk (or object-store key) relative path for one data key —
/// a chunk, shard, or metadata document — given its group path and key name.
///
/// Mirrors the original engine's `construct_data_paths`: `group_path` and
/// `key` are joined with the store's path separator, with no normalization
/// of `..` components (the caller is responsible for well-formed group
/// paths).
#[must_use]
pub fn construct_data_path(group_path: &str, key: &str) -> PathBuf {
    Path::new(group_path).join(key)
}

/// Every ancestor directory of `path`, from the root down to (but not
/// including) `path` itself, in top-down order. Used to pre-create
/// directories before writing the first chunk of an array.
#[must_use]
pub fn get_parent_paths(path: &Path) -> Vec<PathBuf> {
    let mut parents = Vec::new();
    let mut current = path.parent();
    while let Some(p) = current {
        if p.as_os_str().is_empty() {
            break;
        }
        parents.push(p.to_path_buf());
        current = p.parent();
    }
    parents.reverse();
    parents
}

/// Create `path` and all of its ancestors, matching `std::fs::create_dir_all`
/// semantics but returning the crate's own error type.
///
/// # Errors
/// Returns [`crate::error::StreamingError::Io`] if directory creation fails.
pub fn make_dirs(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_data_path_joins_group_and_key() {
        let path = construct_data_path("a/b", "c/0.0");
        assert_eq!(path, PathBuf::from("a/b/c/0.0"));
    }

    #[test]
    fn get_parent_paths_lists_ancestors_top_down() {
        let parents = get_parent_paths(Path::new("a/b/c/d.bin"));
        assert_eq!(
            parents,
            vec![PathBuf::from("a"), PathBuf::from("a/b"), PathBuf::from("a/b/c")]
        );
    }

    #[test]
    fn get_parent_paths_of_top_level_file_is_empty() {
        assert!(get_parent_paths(Path::new("d.bin")).is_empty());
    }
}
