use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::ids::ChunkDescriptor;

/// A stage's work queue: a `Mutex<VecDeque<ChunkDescriptor>>` plus a
/// `Condvar` so worker threads can block instead of busy-polling (§5).
#[derive(Default)]
pub struct ChunkQueue {
    items: Mutex<VecDeque<ChunkDescriptor>>,
    not_empty: Condvar,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: ChunkDescriptor) {
        self.items.lock().unwrap().push_back(chunk);
        self.not_empty.notify_one();
    }

    pub fn push_many(&self, chunks: impl IntoIterator<Item = ChunkDescriptor>) {
        let mut guard = self.items.lock().unwrap();
        guard.extend(chunks);
        self.not_empty.notify_all();
    }

    /// Non-blocking pop, used by the scheduler's own poll loop.
    pub fn try_pop(&self) -> Option<ChunkDescriptor> {
        self.items.lock().unwrap().pop_front()
    }

    /// Blocks up to `timeout` for an item; used by worker-pool threads that
    /// still need to observe a halt flag on timeout rather than wait forever.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ChunkDescriptor> {
        let guard = self.items.lock().unwrap();
        let (mut guard, _) = self
            .not_empty
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .unwrap();
        guard.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
