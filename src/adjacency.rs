use std::collections::HashMap;
use std::io::Read;

use crate::error::{EngineError, EngineResult};

/// Compressed sparse column/row adjacency used for the gather stage.
/// `col_ptrs[v]..col_ptrs[v+1]` indexes into `row_indices`/`edge_values` for
/// the in-edges (CSC) or out-edges (CSR) of local vertex `v`.
#[derive(Debug, Clone)]
pub struct Adjacency {
    pub col_ptrs: Vec<u32>,
    pub row_indices: Vec<u32>,
    pub edge_values: Vec<f32>,
}

impl Adjacency {
    pub fn neighbors(&self, v: usize) -> (&[u32], &[f32]) {
        let lo = self.col_ptrs[v] as usize;
        let hi = self.col_ptrs[v + 1] as usize;
        (&self.row_indices[lo..hi], &self.edge_values[lo..hi])
    }
}

/// One machine's vertex shard: local vertices `0..local_vtx_cnt`, then
/// source-ghost and dest-ghost replicas numbered contiguously afterward.
/// `global_to_ghost` translates a global vertex id arriving on the wire to
/// a local ghost row index.
pub struct GraphShard {
    pub local_vtx_cnt: u32,
    pub forward_adj: Adjacency,  // CSC
    pub backward_adj: Adjacency, // CSR
    pub norm_factor: Vec<f32>,
    pub global_to_ghost: HashMap<u32, u32>,
    pub dst_ghost_cnt: u32,
    /// Outgoing replication table: for each peer node that holds a ghost
    /// copy of one or more of our local vertices, the `(local_row,
    /// wire_gvid)` pairs scatter must send it. Empty on a single-node
    /// cluster, per §4.4 ("N == 1 instantiates no peer sockets at all").
    pub outgoing: HashMap<u32, Vec<(u32, u32)>>,
}

impl GraphShard {
    /// Parses the binary graph-partition format: a fixed header followed by
    /// the CSC/CSR tables and the ghost-mapping table. The format itself is
    /// consumed through this single entry point and is not a pluggable
    /// registry — it is treated as an already-decided wire contract, per the
    /// spec's framing of the on-disk format as an external collaborator.
    pub fn load(path: &std::path::Path) -> EngineResult<Self> {
        let mut f = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Self::parse(&buf)
    }

    fn parse(buf: &[u8]) -> EngineResult<Self> {
        use byteorder::{LittleEndian, ReadBytesExt};
        let mut cur = std::io::Cursor::new(buf);
        let local_vtx_cnt = cur.read_u32::<LittleEndian>()?;
        let fwd_nnz = cur.read_u32::<LittleEndian>()?;
        let bwd_nnz = cur.read_u32::<LittleEndian>()?;
        let ghost_cnt = cur.read_u32::<LittleEndian>()?;

        let read_adj = |cur: &mut std::io::Cursor<&[u8]>, n: u32, nnz: u32| -> EngineResult<Adjacency> {
            let mut col_ptrs = Vec::with_capacity(n as usize + 1);
            for _ in 0..=n {
                col_ptrs.push(cur.read_u32::<LittleEndian>()?);
            }
            let mut row_indices = Vec::with_capacity(nnz as usize);
            for _ in 0..nnz {
                row_indices.push(cur.read_u32::<LittleEndian>()?);
            }
            let mut edge_values = Vec::with_capacity(nnz as usize);
            for _ in 0..nnz {
                edge_values.push(cur.read_f32::<LittleEndian>()?);
            }
            Ok(Adjacency { col_ptrs, row_indices, edge_values })
        };

        let forward_adj = read_adj(&mut cur, local_vtx_cnt, fwd_nnz)?;
        let backward_adj = read_adj(&mut cur, local_vtx_cnt, bwd_nnz)?;

        let mut norm_factor = Vec::with_capacity(local_vtx_cnt as usize);
        for _ in 0..local_vtx_cnt {
            norm_factor.push(cur.read_f32::<LittleEndian>()?);
        }

        let mut global_to_ghost = HashMap::with_capacity(ghost_cnt as usize);
        for _ in 0..ghost_cnt {
            let gvid = cur.read_u32::<LittleEndian>()?;
            let local = cur.read_u32::<LittleEndian>()?;
            global_to_ghost.insert(gvid, local);
        }

        // Outgoing replication table: which peers hold a ghost copy of which
        // of our local vertices, and what global id they expect it under.
        let peer_cnt = cur.read_u32::<LittleEndian>().unwrap_or(0);
        let mut outgoing = HashMap::with_capacity(peer_cnt as usize);
        for _ in 0..peer_cnt {
            let peer_node = cur.read_u32::<LittleEndian>()?;
            let share_cnt = cur.read_u32::<LittleEndian>()?;
            let mut shares = Vec::with_capacity(share_cnt as usize);
            for _ in 0..share_cnt {
                let local_row = cur.read_u32::<LittleEndian>()?;
                let wire_gvid = cur.read_u32::<LittleEndian>()?;
                shares.push((local_row, wire_gvid));
            }
            outgoing.insert(peer_node, shares);
        }

        Ok(Self {
            local_vtx_cnt,
            forward_adj,
            backward_adj,
            norm_factor,
            global_to_ghost,
            dst_ghost_cnt: ghost_cnt,
            outgoing,
        })
    }

    /// This node's share of a scattered chunk's rows, grouped by peer:
    /// `(peer_node, [(local_row, wire_gvid), ...])` restricted to rows in
    /// `[lo, hi)`.
    pub fn outgoing_for_range(&self, lo: u32, hi: u32) -> Vec<(u32, Vec<(u32, u32)>)> {
        self.outgoing
            .iter()
            .filter_map(|(&peer, shares)| {
                let in_range: Vec<(u32, u32)> =
                    shares.iter().copied().filter(|(row, _)| *row >= lo && *row < hi).collect();
                if in_range.is_empty() {
                    None
                } else {
                    Some((peer, in_range))
                }
            })
            .collect()
    }

    /// Translates a wire-visible global vertex id to the local ghost row
    /// index it should be written into, per §4.4: `globalToGhostVtcs[gvid] -
    /// localVtxCnt`.
    pub fn ghost_row(&self, gvid: u32) -> EngineResult<usize> {
        let local = self
            .global_to_ghost
            .get(&gvid)
            .ok_or_else(|| EngineError::GraphError(format!("unknown ghost gvid {gvid}")))?;
        Ok((*local - self.local_vtx_cnt) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_shard() -> GraphShard {
        // 2 local vertices, vertex 1 has an in-edge from vertex 0 with weight 0.5.
        let forward_adj = Adjacency {
            col_ptrs: vec![0, 0, 1],
            row_indices: vec![0],
            edge_values: vec![0.5],
        };
        let backward_adj = Adjacency {
            col_ptrs: vec![0, 1, 1],
            row_indices: vec![1],
            edge_values: vec![0.5],
        };
        GraphShard {
            local_vtx_cnt: 2,
            forward_adj,
            backward_adj,
            norm_factor: vec![1.0, 1.0],
            global_to_ghost: HashMap::from([(99, 2)]),
            dst_ghost_cnt: 1,
            outgoing: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn neighbors_returns_expected_slice() {
        let shard = toy_shard();
        let (rows, vals) = shard.forward_adj.neighbors(1);
        assert_eq!(rows, &[0]);
        assert_eq!(vals, &[0.5]);
    }

    #[test]
    fn zero_degree_vertex_has_empty_neighbor_slice() {
        let shard = toy_shard();
        let (rows, _) = shard.forward_adj.neighbors(0);
        assert!(rows.is_empty());
    }

    #[test]
    fn ghost_row_translates_global_to_local_offset() {
        let shard = toy_shard();
        assert_eq!(shard.ghost_row(99).unwrap(), 0);
    }

    #[test]
    fn ghost_row_rejects_unknown_gvid() {
        let shard = toy_shard();
        assert!(shard.ghost_row(123).is_err());
    }
}
