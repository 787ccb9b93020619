//! The dispatch abstraction (§4.2): the opaque "spawn(chunk) sink" the apply
//! stage hands chunks to. `Mode::Lambda` clusters would implement this over
//! an actual cloud-function invocation API; this crate ships the one
//! implementation it can exercise honestly end-to-end, `ThreadDispatcher`,
//! which spawns a real OS thread running the same worker loop the
//! `compute-worker` binary uses, talking to the graph/weight servers over
//! loopback ZeroMQ sockets exactly as a separate process would.

use std::sync::Arc;

use crate::error::EngineResult;
use crate::ids::ChunkDescriptor;

/// Which half of the apply step a dispatched chunk should perform. The
/// shipped `Gcn` variant never produces edge-NN work (§5), so only the
/// vertex roles are exercised today; `Edge` exists as the documented
/// extension point §5 calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRole {
    ForwardHidden,
    ForwardFinal,
    Backward,
    Edge,
}

/// `layer_dims`: `(input_dim, output_dim)` of the layer the dispatched chunk
/// is applying, so the worker knows the weight tensor shapes to pull.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, chunk: ChunkDescriptor, layer_dims: (usize, usize), role: ApplyRole) -> EngineResult<()>;
}

/// Endpoints a dispatched worker needs to reach: the graph server's
/// compute-worker-facing socket and the weight server's.
#[derive(Debug, Clone)]
pub struct WorkerEndpoints {
    pub graph_server_addr: String,
    pub weight_server_addr: String,
}

/// Spawns an OS thread per dispatched chunk running
/// [`crate::rpc::worker_client::run_once`]. Threads are detached; the
/// scheduler tracks completion via the timeout table and PUSH acks, not via
/// joining, matching the original design's "the compute worker may die
/// silently and nobody waits on it" assumption.
pub struct ThreadDispatcher {
    endpoints: Arc<WorkerEndpoints>,
}

impl ThreadDispatcher {
    pub fn new(endpoints: WorkerEndpoints) -> Self {
        Self { endpoints: Arc::new(endpoints) }
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, chunk: ChunkDescriptor, layer_dims: (usize, usize), role: ApplyRole) -> EngineResult<()> {
        let endpoints = self.endpoints.clone();
        std::thread::Builder::new()
            .name(format!("worker-{}-{}", chunk.global_id, chunk.layer))
            .spawn(move || {
                if let Err(e) = crate::rpc::worker_client::run_once(&endpoints, chunk, layer_dims, role) {
                    tracing::warn!(chunk = ?chunk, error = %e, "compute worker exited with error");
                }
            })
            .map_err(crate::error::EngineError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_role_variants_are_distinct() {
        assert_ne!(ApplyRole::ForwardHidden, ApplyRole::Backward);
    }
}
