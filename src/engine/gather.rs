use ndarray::Array2;

use crate::adjacency::{Adjacency, GraphShard};
use crate::ids::ChunkDescriptor;
use crate::tensor::Tensor;

/// Computes `ah[v] = normFactor(v) * h[v] + Σ edgeWeight(u,v) * h[u]` for
/// every local vertex `v` in `[lo, hi)`, reading `h` for ghost neighbors from
/// `ghost_h`. Serves both directions: forward passes the CSC adjacency and
/// `h`; backward passes the CSR adjacency and the incoming gradient tensor,
/// producing `aTg` under the same formula (§4.1.1).
pub fn gather_range(
    adj: &Adjacency,
    norm_factor: &[f32],
    local_vtx_cnt: u32,
    h: &Tensor,
    ghost_h: Option<&Tensor>,
    lo: usize,
    hi: usize,
) -> Array2<f32> {
    let feat_dim = h.cols();
    let mut out = Array2::<f32>::zeros((hi - lo, feat_dim));
    let h_arr = h.as_array();
    let local_vtx_cnt = local_vtx_cnt as usize;

    for (row_idx, v) in (lo..hi).enumerate() {
        let (neighbors, weights) = adj.neighbors(v);
        let mut acc = h_arr.row(v).to_owned() * norm_factor[v];
        for (&u, &w) in neighbors.iter().zip(weights.iter()) {
            let u = u as usize;
            let src_row = if u < local_vtx_cnt {
                h_arr.row(u).to_owned()
            } else {
                ghost_h
                    .expect("ghost neighbor present but no ghost buffer supplied")
                    .as_array()
                    .row(u - local_vtx_cnt)
                    .to_owned()
            };
            acc += &(src_row * w);
        }
        out.row_mut(row_idx).assign(&acc);
    }
    out
}

/// Runs the gather stage for one chunk, dispatching to the forward (CSC) or
/// backward (CSR) adjacency depending on the chunk's direction, and writes
/// the result into `ah`/`aTg` at the chunk's row range.
pub fn gather_chunk(
    shard: &GraphShard,
    chunk: &ChunkDescriptor,
    source: &Tensor,
    ghost_source: Option<&Tensor>,
    dest: &mut Tensor,
) {
    let (lo, hi) = (chunk.low_bound as usize, chunk.up_bound as usize);
    let adj = match chunk.direction {
        crate::ids::Direction::Forward => &shard.forward_adj,
        crate::ids::Direction::Backward => &shard.backward_adj,
    };
    let result = gather_range(adj, &shard.norm_factor, shard.local_vtx_cnt, source, ghost_source, lo, hi);
    dest.row_slice_mut(lo, hi).assign(&result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Direction;
    use std::collections::HashMap;

    fn toy_shard() -> GraphShard {
        // vertex 1's only in-edge is from vertex 0 with weight 0.5.
        GraphShard {
            local_vtx_cnt: 2,
            forward_adj: Adjacency { col_ptrs: vec![0, 0, 1], row_indices: vec![0], edge_values: vec![0.5] },
            backward_adj: Adjacency { col_ptrs: vec![0, 1, 1], row_indices: vec![1], edge_values: vec![0.5] },
            norm_factor: vec![1.0, 1.0],
            global_to_ghost: HashMap::new(),
            dst_ghost_cnt: 0,
            outgoing: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn gather_combines_self_and_neighbor_rows() {
        let shard = toy_shard();
        let h = Tensor::new("h", 2, 1, vec![2.0, 10.0]).unwrap();
        let out = gather_range(&shard.forward_adj, &shard.norm_factor, shard.local_vtx_cnt, &h, None, 0, 2);
        // v=0: no in-edges, norm*h[0] = 2.0
        assert_eq!(out[[0, 0]], 2.0);
        // v=1: norm*h[1] + 0.5*h[0] = 10.0 + 1.0 = 11.0
        assert_eq!(out[[1, 0]], 11.0);
    }

    #[test]
    fn gather_chunk_writes_only_its_row_range() {
        let shard = toy_shard();
        let h = Tensor::new("h", 2, 1, vec![2.0, 10.0]).unwrap();
        let mut ah = Tensor::zeros("ah", 2, 1);
        let chunk = ChunkDescriptor::new(0, 1, 0, 1, 2, 0, Direction::Forward, 0);
        gather_chunk(&shard, &chunk, &h, None, &mut ah);
        assert_eq!(ah.as_array()[[0, 0]], 0.0, "row outside the chunk must be untouched");
        assert_eq!(ah.as_array()[[1, 0]], 11.0);
    }

    #[test]
    fn gather_reads_ghost_rows_for_cross_shard_neighbors() {
        let adj = Adjacency { col_ptrs: vec![0, 1], row_indices: vec![2], edge_values: vec![1.0] };
        let norm = vec![0.0];
        let h = Tensor::zeros("h", 1, 1);
        let ghost = Tensor::new("fg", 1, 1, vec![9.0]).unwrap();
        let out = gather_range(&adj, &norm, 1, &h, Some(&ghost), 0, 1);
        assert_eq!(out[[0, 0]], 9.0);
    }
}
