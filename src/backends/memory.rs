//! In-process memory `Backend` — the reference adaptor used by this
//! crate's own tests and by anyone wiring a brand-new backend.
//!
//! Grounded in `kombu.transport.virtual.exchange`'s in-memory counterpart
//! and the queue-per-name storage model used throughout
//! `examples/original_source/kombu/transport/filesystem.py`: every queue
//! is just an ordered sequence of serialized records, looked up by name.

use crate::backend::{Backend, Capabilities};
use crate::error::Result;
use std::collections::{HashMap, VecDeque};

#[derive(Default)]
pub struct MemoryBackend {
    queues: HashMap<String, VecDeque<String>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    /// Explicitly create an (initially empty) queue. `put`/`get` also
    /// auto-vivify a queue on first use, the way `filesystem.py`'s
    /// directory-scan based backend does; this method exists for callers
    /// that want `has_queue` to report true before any message flows.
    pub fn declare_queue(&mut self, name: &str) {
        self.queues.entry(name.to_owned()).or_default();
    }
}

impl Backend for MemoryBackend {
    fn put(&mut self, queue: &str, payload: &str, _priority: u8) -> Result<()> {
        self.queues.entry(queue.to_owned()).or_default().push_back(payload.to_owned());
        Ok(())
    }

    fn get(&mut self, queue: &str) -> Result<Option<String>> {
        Ok(self.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    fn size(&mut self, queue: &str) -> Result<u64> {
        Ok(self.queues.get(queue).map(VecDeque::len).unwrap_or(0) as u64)
    }

    fn purge(&mut self, queue: &str) -> Result<u64> {
        match self.queues.get_mut(queue) {
            Some(q) => {
                let n = q.len() as u64;
                q.clear();
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn delete(&mut self, queue: &str) -> Result<()> {
        self.queues.remove(queue);
        Ok(())
    }

    fn has_queue(&mut self, queue: &str) -> Result<bool> {
        Ok(self.queues.contains_key(queue))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fanout_publish: false,
            ping: false,
        }
    }
}
