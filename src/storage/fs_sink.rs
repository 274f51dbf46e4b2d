//! Filesystem [`Sink`] backed by a bounded pool of open file handles.
//!
//! Each array can have many more chunk/shard keys in flight than the process
//! wants open file descriptors at once, so handles are recycled through a
//! small LRU: opening a new path evicts the least-recently-used handle once
//! the pool is at capacity, writing it back via `close` first if still dirty.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use parking_lot::RwLock;

use crate::error::{Result, StreamingError};
use crate::storage::sink::{get_parent_paths, make_dirs, Sink, SinkFactory, SinkState};

/// Default number of file handles the pool keeps open at once.
pub const DEFAULT_HANDLE_POOL_CAPACITY: usize = 64;

struct HandleEntry {
    file: File,
    last_used: u64,
}

/// A bounded-capacity pool of open file handles, keyed by path, shared by
/// every [`FileSink`] rooted under the same store.
pub struct HandlePool {
    capacity: usize,
    clock: Mutex<u64>,
    handles: Mutex<HashMap<PathBuf, HandleEntry>>,
}

impl HandlePool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: Mutex::new(0),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn tick(&self) -> u64 {
        let mut clock = self.clock.lock().unwrap();
        *clock += 1;
        *clock
    }

    /// Run `f` with a writable handle to `path`, opening (and creating parent
    /// directories for) it on first use, evicting the least-recently-used
    /// entry if the pool is full.
    ///
    /// # Errors
    /// Returns [`StreamingError::Io`] if the file cannot be opened, the
    /// parent directories cannot be created, or `f` itself fails.
    fn with_handle<F>(&self, path: &Path, f: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> std::io::Result<()>,
    {
        let now = self.tick();
        let mut handles = self.handles.lock().unwrap();
        if !handles.contains_key(path) {
            if handles.len() >= self.capacity {
                if let Some(evict_path) = handles
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(p, _)| p.clone())
                {
                    handles.remove(&evict_path);
                }
            }
            for parent in get_parent_paths(path) {
                make_dirs(&parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .read(true)
                .truncate(false)
                .open(path)?;
            handles.insert(
                path.to_path_buf(),
                HandleEntry {
                    file,
                    last_used: now,
                },
            );
        }
        let entry = handles.get_mut(path).expect("just inserted or present");
        entry.last_used = now;
        f(&mut entry.file)?;
        Ok(())
    }

    /// Drop any cached handle for `path`, flushing it first.
    ///
    /// # Errors
    /// Returns [`StreamingError::Io`] if the flush fails.
    fn evict(&self, path: &Path) -> Result<()> {
        let mut handles = self.handles.lock().unwrap();
        if let Some(mut entry) = handles.remove(path) {
            entry.file.flush()?;
        }
        Ok(())
    }
}

/// A [`Sink`] that writes one key as a single file under a shared
/// [`HandlePool`].
pub struct FileSink {
    path: PathBuf,
    pool: std::sync::Arc<HandlePool>,
    state: RwLock<SinkState>,
}

impl FileSink {
    #[must_use]
    pub fn new(path: PathBuf, pool: std::sync::Arc<HandlePool>) -> Self {
        Self {
            path,
            pool,
            state: RwLock::new(SinkState::Open),
        }
    }
}

impl Sink for FileSink {
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
        self.pool.with_handle(&self.path, |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(bytes)
        })
    }

    fn finalize(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state == SinkState::Finalized {
            return Ok(());
        }
        self.pool.evict(&self.path)?;
        *state = SinkState::Finalized;
        Ok(())
    }

    fn state(&self) -> SinkState {
        *self.state.read()
    }
}

/// Creates [`FileSink`]s rooted at a store directory, sharing one
/// [`HandlePool`] across every sink it opens.
pub struct FsSinkFactory {
    root: PathBuf,
    pool: std::sync::Arc<HandlePool>,
}

impl FsSinkFactory {
    #[must_use]
    pub fn new(root: PathBuf, handle_pool_capacity: usize) -> Self {
        Self {
            root,
            pool: std::sync::Arc::new(HandlePool::new(handle_pool_capacity)),
        }
    }
}

impl SinkFactory for FsSinkFactory {
    fn create_sink(&self, relative_path: &str) -> Result<std::sync::Arc<dyn Sink>> {
        let path = self.root.join(relative_path);
        Ok(std::sync::Arc::new(FileSink::new(
            path,
            std::sync::Arc::clone(&self.pool),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn write_then_finalize_persists_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(HandlePool::new(4));
        let path = dir.path().join("a/b/0.0");
        let sink = FileSink::new(path.clone(), pool);
        sink.write(0, b"hello").unwrap();
        sink.write(5, b" world").unwrap();
        sink.finalize().unwrap();
        assert_eq!(sink.state(), SinkState::Finalized);

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn write_after_finalize_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(HandlePool::new(4));
        let sink = FileSink::new(dir.path().join("x.bin"), pool);
        sink.write(0, b"a").unwrap();
        sink.finalize().unwrap();
        assert!(sink.write(0, b"b").is_err());
    }

    #[test]
    fn pool_evicts_least_recently_used_handle_under_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(HandlePool::new(1));
        let sink_a = FileSink::new(dir.path().join("a.bin"), std::sync::Arc::clone(&pool));
        let sink_b = FileSink::new(dir.path().join("b.bin"), std::sync::Arc::clone(&pool));
        sink_a.write(0, b"aaaa").unwrap();
        sink_b.write(0, b"bbbb").unwrap();
        sink_a.finalize().unwrap();
        sink_b.finalize().unwrap();
        assert_eq!(pool.handles.lock().unwrap().len(), 0);
    }
}
