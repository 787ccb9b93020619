use super::ghost::GHOST_MSG_HDR;
use crate::tensor::Tensor;
use crate::wire::MAX_MSG_SIZE;

/// Per-vertex id width on the wire.
const ID_SIZE: usize = 4;

/// `max(1, floor((MAX_MSG - HDR) / (sizeof(id) + featDim*sizeof(float))))`,
/// the number of vertices that fit in one outgoing ghost-update message
/// (§4.1.3).
pub fn batch_capacity(feat_dim: usize) -> usize {
    let per_vertex = ID_SIZE + feat_dim * 4;
    ((MAX_MSG_SIZE - GHOST_MSG_HDR) / per_vertex).max(1)
}

/// One destination peer's share of a chunk's scattered rows: the global ids
/// of the local vertices that peer replicates, in row order.
pub struct PeerShare {
    pub peer_node: u32,
    pub gvids: Vec<u32>,
}

/// Splits a chunk's scatter output into per-peer batches no larger than
/// `batch_capacity(feat_dim)` vertices each. Returns, per peer, a list of
/// `(gvid, local_row)` groups ready for `ghost::encode_update`.
pub fn batch_for_peer(share: &PeerShare, feat_dim: usize) -> Vec<Vec<u32>> {
    let cap = batch_capacity(feat_dim);
    share.gvids.chunks(cap).map(|c| c.to_vec()).collect()
}

/// Reads a chunk's row range out of `source` (`h` forward, `grad` backward)
/// so the caller can hand it to `ghost::encode_update` per recipient.
pub fn chunk_output_rows<'a>(source: &'a Tensor, lo: usize, hi: usize) -> ndarray::ArrayView2<'a, f32> {
    source.row_slice(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_capacity_is_at_least_one_for_huge_features() {
        assert_eq!(batch_capacity(10_000_000), 1);
    }

    #[test]
    fn batch_capacity_matches_formula_for_small_features() {
        let feat_dim = 16;
        let per_vertex = ID_SIZE + feat_dim * 4;
        let expected = (MAX_MSG_SIZE - GHOST_MSG_HDR) / per_vertex;
        assert_eq!(batch_capacity(feat_dim), expected);
    }

    #[test]
    fn batch_for_peer_splits_into_capacity_sized_groups() {
        let share = PeerShare { peer_node: 1, gvids: (0..10).collect() };
        let batches = batch_for_peer(&share, 4);
        let cap = batch_capacity(4);
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 10);
        assert!(batches.iter().all(|b| b.len() <= cap));
    }
}
