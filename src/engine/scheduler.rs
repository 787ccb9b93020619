use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::engine::barrier::HaltableBarrier;
use crate::engine::ghost::GhostProgress;
use crate::engine::queue::ChunkQueue;
use crate::engine::timeout_table::TimeoutTable;
use crate::ids::{ChunkDescriptor, Direction};

/// How many epochs may be in flight in the pipeline at once. `Unbounded`
/// relies purely on the layer barrier for synchronization (§4.2 Staleness).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Bounded(u32),
    Unbounded,
}

impl Staleness {
    pub fn admits(&self, oldest_incomplete_epoch: u32, candidate_epoch: u32) -> bool {
        match self {
            Staleness::Unbounded => true,
            Staleness::Bounded(s) => candidate_epoch.saturating_sub(oldest_incomplete_epoch) <= *s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Gather,
    Apply,
    Scatter,
}

/// Tracks completion of one (layer, direction) pair: local scatters done and
/// expected ghost receipts done (§4.1.4).
struct LayerProgress {
    num_chunks: u32,
    chunks_scattered: AtomicU32,
    expected_ghost: u32,
    ghost_progress: GhostProgress,
}

impl LayerProgress {
    fn new(num_chunks: u32, expected_ghost: u32) -> Self {
        Self { num_chunks, chunks_scattered: AtomicU32::new(0), expected_ghost, ghost_progress: GhostProgress::default() }
    }

    fn is_complete(&self) -> bool {
        self.chunks_scattered.load(Ordering::SeqCst) >= self.num_chunks
            && self.ghost_progress.is_complete(self.expected_ghost)
    }
}

/// The per-machine pipeline scheduler: owns the gather/apply/scatter queues,
/// the chunk-stage map, and the layer-transition barrier. One instance runs
/// on a single long-lived scheduler thread per graph server (§4.1, §5).
pub struct Scheduler {
    pub gather_queue: ChunkQueue,
    pub apply_queue: ChunkQueue,
    pub scatter_queue: ChunkQueue,
    pub timeout_table: TimeoutTable,
    pub halt: AtomicBool,
    pub staleness: Staleness,
    num_layers: u32,
    num_chunks_per_layer: u32,
    local_vtx_cnt: u32,
    stage_of: Mutex<HashMap<ChunkDescriptor, Stage>>,
    layer_progress: Mutex<HashMap<(u32, Direction), LayerProgress>>,
    barrier: HaltableBarrier,
}

impl Scheduler {
    pub fn new(
        num_layers: u32,
        num_chunks_per_layer: u32,
        local_vtx_cnt: u32,
        staleness: Staleness,
        barrier_participants: usize,
    ) -> Self {
        Self {
            gather_queue: ChunkQueue::new(),
            apply_queue: ChunkQueue::new(),
            scatter_queue: ChunkQueue::new(),
            timeout_table: TimeoutTable::new(),
            halt: AtomicBool::new(false),
            staleness,
            num_layers,
            num_chunks_per_layer,
            local_vtx_cnt,
            stage_of: Mutex::new(HashMap::new()),
            layer_progress: Mutex::new(HashMap::new()),
            barrier: HaltableBarrier::new(barrier_participants),
        }
    }

    /// Initializes per-epoch state and enqueues every chunk for the gather
    /// stage of layer 0 forward.
    pub fn start_epoch(&self, epoch: u32, expected_ghost_layer0: u32) {
        self.register_and_enqueue_layer(0, Direction::Forward, epoch, expected_ghost_layer0);
    }

    /// Registers a fresh `LayerProgress` for `(layer, dir)` and enqueues every
    /// local chunk of that layer onto the gather queue (§4.1.4). Generalizes
    /// `start_epoch`, which only ever drives layer 0 forward, to any layer the
    /// forward/backward sweep transitions into.
    pub fn register_and_enqueue_layer(&self, layer: u32, dir: Direction, epoch: u32, expected_ghost: u32) {
        self.register_layer(layer, dir, expected_ghost);
        let bounds = crate::ids::chunk_bounds(self.local_vtx_cnt, self.num_chunks_per_layer);
        let mut stage_of = self.stage_of.lock().unwrap();
        let chunks: Vec<ChunkDescriptor> = (0..self.num_chunks_per_layer)
            .map(|i| {
                let (lo, hi) = bounds[i as usize];
                let c = ChunkDescriptor::new(0, self.num_chunks_per_layer, i, lo, hi, layer, dir, epoch);
                stage_of.insert(c, Stage::Gather);
                c
            })
            .collect();
        drop(stage_of);
        self.gather_queue.push_many(chunks);
    }

    fn register_layer(&self, layer: u32, dir: Direction, expected_ghost: u32) {
        let mut progress = self.layer_progress.lock().unwrap();
        progress.insert((layer, dir), LayerProgress::new(self.num_chunks_per_layer, expected_ghost));
    }

    /// Blocks the calling (scheduler) thread until `(layer, dir)` is ready
    /// for the cross-node barrier, sleeping with exponential backoff (start
    /// 100 µs, cap 5 ms) whenever the queues have nothing left to do (§5).
    /// Returns `false` if a halt was requested while waiting.
    pub fn wait_for_layer_ready(&self, layer: u32, dir: Direction) -> bool {
        let mut backoff = Duration::from_micros(100);
        let cap = Duration::from_millis(5);
        loop {
            if self.halt.load(Ordering::Relaxed) {
                return false;
            }
            if self.layer_ready_for_barrier(layer, dir) {
                return true;
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(cap);
        }
    }

    /// Advances `chunk` from its current stage to the next, routing the
    /// chunk onto the appropriate queue. Returns the stage it moved to, or
    /// `None` if the chunk isn't tracked (already completed / unknown).
    pub fn advance(&self, chunk: ChunkDescriptor) -> Option<Stage> {
        let mut stage_of = self.stage_of.lock().unwrap();
        let next = match stage_of.get(&chunk)? {
            Stage::Gather => Stage::Apply,
            Stage::Apply => Stage::Scatter,
            Stage::Scatter => {
                stage_of.remove(&chunk);
                drop(stage_of);
                self.on_scatter_complete(chunk);
                return None;
            }
        };
        stage_of.insert(chunk, next);
        drop(stage_of);
        match next {
            Stage::Apply => self.apply_queue.push(chunk),
            Stage::Scatter => self.scatter_queue.push(chunk),
            Stage::Gather => unreachable!(),
        }
        Some(next)
    }

    /// Called once a chunk's local scatter and all its ghost sends are
    /// acknowledged as dispatched. Bumps the layer's scattered counter; if
    /// this was the last chunk, checks whether the whole (layer, direction)
    /// is done and releases the barrier if so.
    pub fn on_scatter_complete(&self, chunk: ChunkDescriptor) {
        let progress = self.layer_progress.lock().unwrap();
        if let Some(lp) = progress.get(&(chunk.layer, chunk.direction)) {
            lp.chunks_scattered.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Records an incoming ghost batch against the current (layer,
    /// direction)'s progress counter (§4.4).
    pub fn record_ghost_receipt(&self, layer: u32, dir: Direction, count: u32) {
        let progress = self.layer_progress.lock().unwrap();
        if let Some(lp) = progress.get(&(layer, dir)) {
            lp.ghost_progress.add(count);
        }
    }

    /// True once every chunk of `(layer, dir)` has scattered locally and all
    /// expected ghost updates have arrived (§4.1.4).
    pub fn layer_ready_for_barrier(&self, layer: u32, dir: Direction) -> bool {
        self.layer_progress
            .lock()
            .unwrap()
            .get(&(layer, dir))
            .map(|lp| lp.is_complete())
            .unwrap_or(false)
    }

    /// Blocks until every graph server reaches the same layer boundary.
    pub fn cross_node_barrier(&self) -> bool {
        self.barrier.wait(&self.halt)
    }

    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::Relaxed);
    }

    pub fn num_layers(&self) -> u32 {
        self.num_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_unbounded_admits_any_epoch() {
        assert!(Staleness::Unbounded.admits(0, 1000));
    }

    #[test]
    fn staleness_bounded_rejects_too_far_ahead() {
        let s = Staleness::Bounded(1);
        assert!(s.admits(0, 1));
        assert!(!s.admits(0, 2));
    }

    #[test]
    fn start_epoch_enqueues_all_chunks_for_gather() {
        let sched = Scheduler::new(2, 4, 4, Staleness::Unbounded, 1);
        sched.start_epoch(0, 0);
        assert_eq!(sched.gather_queue.len(), 4);
    }

    #[test]
    fn advance_routes_gather_to_apply_to_scatter_then_completes() {
        let sched = Scheduler::new(1, 1, 1, Staleness::Unbounded, 1);
        sched.start_epoch(0, 0);
        let chunk = sched.gather_queue.try_pop().unwrap();
        assert_eq!(sched.advance(chunk), Some(Stage::Apply));
        assert_eq!(sched.apply_queue.try_pop().unwrap(), chunk);
        assert_eq!(sched.advance(chunk), Some(Stage::Scatter));
        assert_eq!(sched.scatter_queue.try_pop().unwrap(), chunk);
        assert_eq!(sched.advance(chunk), None, "scatter -> complete, chunk no longer tracked");
    }

    #[test]
    fn layer_completes_only_after_scatter_and_ghost_receipts() {
        let sched = Scheduler::new(1, 1, 1, Staleness::Unbounded, 1);
        sched.start_epoch(0, 2);
        let chunk = sched.gather_queue.try_pop().unwrap();
        sched.advance(chunk);
        sched.advance(chunk);
        assert!(!sched.layer_ready_for_barrier(0, Direction::Forward));
        sched.advance(chunk); // scatter -> complete
        assert!(!sched.layer_ready_for_barrier(0, Direction::Forward), "ghosts not yet received");
        sched.record_ghost_receipt(0, Direction::Forward, 2);
        assert!(sched.layer_ready_for_barrier(0, Direction::Forward));
    }
}
