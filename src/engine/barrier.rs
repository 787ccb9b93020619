use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Layer-transition rendezvous across all graph servers in the cluster.
///
/// `std::sync::Barrier` can't be told about a shutdown in progress, so this
/// is the same counter-plus-`Condvar` rendezvous built by hand elsewhere for
/// that reason (§5): every participant calls `wait()`; the last arrival
/// resets the generation and wakes everyone else.
pub struct HaltableBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
    participants: usize,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl HaltableBarrier {
    pub fn new(participants: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState { arrived: 0, generation: 0 }),
            cv: Condvar::new(),
            participants: participants.max(1),
        }
    }

    /// Blocks until every participant has called `wait`, or until `halt`
    /// flips true. Returns `true` if the barrier released normally, `false`
    /// if it returned early because of halt.
    pub fn wait(&self, halt: &AtomicBool) -> bool {
        let mut guard = self.state.lock().unwrap();
        let my_generation = guard.generation;
        guard.arrived += 1;

        if guard.arrived == self.participants {
            guard.arrived = 0;
            guard.generation += 1;
            self.cv.notify_all();
            return true;
        }

        loop {
            if halt.load(Ordering::Relaxed) {
                return false;
            }
            let (g, timed_out) = self
                .cv
                .wait_timeout_while(guard, std::time::Duration::from_millis(200), |s| {
                    s.generation == my_generation && !halt.load(Ordering::Relaxed)
                })
                .unwrap();
            guard = g;
            if guard.generation != my_generation {
                return true;
            }
            if halt.load(Ordering::Relaxed) {
                return false;
            }
            let _ = timed_out;
        }
    }
}
