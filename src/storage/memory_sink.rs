//! An in-memory [`Sink`] used by unit and integration tests so they don't
//! need a filesystem or network fixture.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use parking_lot::RwLock;

use crate::error::{Result, StreamingError};
use crate::storage::sink::{Sink, SinkFactory, SinkState};

/// A [`Sink`] that writes into a growable in-memory buffer.
#[derive(Default)]
pub struct MemorySink {
    buffer: Mutex<Vec<u8>>,
    state: RwLock<SinkState>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the bytes written so far. Only meaningful after
    /// [`Sink::finalize`] in production code, but tests may peek earlier.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().unwrap().clone()
    }
}

impl Sink for MemorySink {
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
        *self.state.write() = SinkState::Finalized;
        Ok(())
    }

    fn state(&self) -> SinkState {
        *self.state.read()
    }
}

/// Creates [`MemorySink`]s and keeps every one of them reachable by its
/// relative path, so tests can assert on exactly what a writer produced.
#[derive(Default)]
pub struct MemorySinkFactory {
    sinks: Mutex<HashMap<String, Arc<MemorySink>>>,
}

impl MemorySinkFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every key this factory has ever opened a sink for, with
    /// its current (or finalized) contents.
    #[must_use]
    pub fn all_contents(&self) -> HashMap<String, Vec<u8>> {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.contents()))
            .collect()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create_sink(&self, relative_path: &str) -> Result<Arc<dyn Sink>> {
        let sink = Arc::new(MemorySink::new());
        self.sinks
            .lock()
            .unwrap()
            .insert(relative_path.to_string(), Arc::clone(&sink));
        Ok(sink as Arc<dyn Sink>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_writes_land_at_their_offsets() {
        let sink = MemorySink::new();
        sink.write(5, b"world").unwrap();
        sink.write(0, b"hello").unwrap();
        assert_eq!(sink.contents(), b"helloworld");
    }

    #[test]
    fn factory_tracks_every_sink_it_opens() {
        let factory = MemorySinkFactory::new();
        let sink = factory.create_sink("group/array/0.0").unwrap();
        sink.write(0, b"data").unwrap();
        sink.finalize().unwrap();
        let all = factory.all_contents();
        assert_eq!(all.get("group/array/0.0").unwrap(), b"data");
    }
}
