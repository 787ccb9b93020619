use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ids::ChunkDescriptor;

/// Tracks chunks currently dispatched to a compute worker and awaiting a
/// response. Membership is the sole authority for "is this request live":
/// every PULL/PUSH/EVAL/FIN handler's first action is a lock-protected
/// membership check (§4.2), and a successful PUSH removes the chunk
/// atomically so a racing duplicate finds it absent.
#[derive(Default)]
pub struct TimeoutTable {
    inner: Mutex<HashSet<ChunkDescriptor>>,
}

impl TimeoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly dispatched chunk. Called once per dispatch, and
    /// again on every relaunch with the same descriptor.
    pub fn insert(&self, chunk: ChunkDescriptor) {
        self.inner.lock().unwrap().insert(chunk);
    }

    pub fn contains(&self, chunk: &ChunkDescriptor) -> bool {
        self.inner.lock().unwrap().contains(chunk)
    }

    /// First-response-wins removal: returns `true` only for the call that
    /// actually found (and removed) the chunk. A concurrent duplicate
    /// request for the same chunk sees `false` and must be discarded.
    pub fn remove(&self, chunk: &ChunkDescriptor) -> bool {
        self.inner.lock().unwrap().remove(chunk)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exponential backoff for the graph server's relaunch decision: starts at
/// `initial`, multiplies by `factor` on each consecutive failure, caps at
/// `max`, and aborts the process after `abort_after` consecutive failures
/// (default 100) per §4.2.
pub struct RelaunchBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    abort_after: u32,
    consecutive_failures: u32,
}

impl RelaunchBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64, abort_after: u32) -> Self {
        Self { initial, max, factor, abort_after, consecutive_failures: 0 }
    }

    /// Server-side default: 5s initial, no hard cap distinct from growth,
    /// abort after 100 consecutive failures.
    pub fn server_default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300), 1.5, 100)
    }

    /// Worker-side default pull-retry backoff: 5ms initial, 500ms cap.
    pub fn worker_default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_millis(500), 1.5, u32::MAX)
    }

    pub fn current(&self) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(self.consecutive_failures as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    /// Records a failed attempt (timeout / empty pull) and returns the
    /// duration to sleep before the next attempt, or `None` if the abort
    /// limit has been reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        if self.consecutive_failures >= self.abort_after {
            return None;
        }
        let wait = self.current();
        self.consecutive_failures += 1;
        Some(wait)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Per-dispatch deadline bookkeeping, used by the apply-vertex driver thread
/// to decide when a chunk is due for relaunch.
pub struct Deadline {
    pub dispatched_at: Instant,
    pub timeout: Duration,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self { dispatched_at: Instant::now(), timeout }
    }

    pub fn expired(&self) -> bool {
        self.dispatched_at.elapsed() >= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Direction;

    fn chunk(epoch: u32) -> ChunkDescriptor {
        ChunkDescriptor::new(0, 1, 0, 0, 10, 0, Direction::Forward, epoch)
    }

    #[test]
    fn first_remove_wins_duplicate_loses() {
        let table = TimeoutTable::new();
        let c = chunk(0);
        table.insert(c);
        assert!(table.remove(&c));
        assert!(!table.remove(&c), "a second remove for the same chunk must fail");
    }

    #[test]
    fn contains_reflects_dispatch_state() {
        let table = TimeoutTable::new();
        let c = chunk(1);
        assert!(!table.contains(&c));
        table.insert(c);
        assert!(table.contains(&c));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = RelaunchBackoff::new(Duration::from_millis(5), Duration::from_millis(500), 1.5, 100);
        let first = b.record_failure().unwrap();
        assert_eq!(first, Duration::from_millis(5));
        for _ in 0..30 {
            b.record_failure();
        }
        assert!(b.current() <= Duration::from_millis(500));
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut b = RelaunchBackoff::new(Duration::from_millis(5), Duration::from_millis(500), 1.5, 100);
        b.record_failure();
        b.record_failure();
        assert!(b.consecutive_failures() > 0);
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn backoff_reaches_abort_limit() {
        let mut b = RelaunchBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 1.0, 3);
        assert!(b.record_failure().is_some());
        assert!(b.record_failure().is_some());
        assert!(b.record_failure().is_some());
        assert!(b.record_failure().is_none(), "must report abort once the limit is reached");
    }
}
