use serde::{Deserialize, Serialize};

/// Direction of a training sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

/// Immutable identity of one unit of pipeline work: a contiguous row-range of
/// local vertices within one layer/direction/epoch.
///
/// Derives `Copy` so it travels by value across thread boundaries and keys
/// the timeout table and chunk queues without needing to be cloned or locked
/// alongside the data it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub local_id: u32,
    pub global_id: u64,
    pub low_bound: u32,
    pub up_bound: u32,
    pub layer: u32,
    pub direction: Direction,
    pub epoch: u32,
    /// True for vertex-NN chunks, false for edge-NN chunks (§5's apply-edge
    /// driver thread). The shipped GCN variant only ever produces vertex
    /// chunks; the field exists so the edge path has somewhere to plug in.
    pub vertex: bool,
}

impl ChunkDescriptor {
    pub fn new(
        node_id: u32,
        chunks_per_node: u32,
        local_id: u32,
        low_bound: u32,
        up_bound: u32,
        layer: u32,
        direction: Direction,
        epoch: u32,
    ) -> Self {
        Self {
            local_id,
            global_id: node_id as u64 * chunks_per_node as u64 + local_id as u64,
            low_bound,
            up_bound,
            layer,
            direction,
            epoch,
            vertex: true,
        }
    }

    pub fn row_count(&self) -> usize {
        (self.up_bound - self.low_bound) as usize
    }

    /// The layer of the tensor map this chunk's apply step reads/writes.
    /// Backward chunks read the gradient of the *next* layer up, mirroring
    /// the original engine's `chunk.vertex ? chunk.layer : chunk.layer - 1`.
    pub fn feat_layer(&self) -> u32 {
        if self.vertex {
            self.layer
        } else {
            self.layer.saturating_sub(1)
        }
    }
}

/// Computes chunk boundaries for `local_vtx_cnt` local vertices split into
/// `num_chunks` pieces. The last chunk absorbs the remainder, so with `L` not
/// divisible by `K` it covers `L - (K-1)*ceil(L/K)` rows rather than being
/// empty or negative.
pub fn chunk_bounds(local_vtx_cnt: u32, num_chunks: u32) -> Vec<(u32, u32)> {
    assert!(num_chunks > 0, "num_chunks must be positive");
    let base = local_vtx_cnt.div_ceil(num_chunks);
    let mut bounds = Vec::with_capacity(num_chunks as usize);
    let mut lo = 0;
    for i in 0..num_chunks {
        let hi = if i == num_chunks - 1 {
            local_vtx_cnt
        } else {
            (lo + base).min(local_vtx_cnt)
        };
        bounds.push((lo, hi));
        lo = hi;
    }
    bounds
}
