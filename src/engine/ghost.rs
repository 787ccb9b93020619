use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::adjacency::GraphShard;
use crate::error::{EngineError, EngineResult};
use crate::ids::Direction;
use crate::tensor::Tensor;

/// Ghost-message header size: `{featDim: u32, layer: u32, dir: u32, count: u32}`
/// = 16 bytes (§4.4, §8 Scenario 5).
pub const GHOST_MSG_HDR: usize = 16;

/// Encodes a ghost-update message per §4.4:
/// `[featDim: u32][layer: u32][dir: u32][count: u32] (gvid: u32, row: featDim×f32)*`.
pub fn encode_update(feat_dim: u32, layer: u32, dir: Direction, entries: &[(u32, &[f32])]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(GHOST_MSG_HDR + entries.len() * (4 + feat_dim as usize * 4));
    buf.write_u32::<LittleEndian>(feat_dim).unwrap();
    buf.write_u32::<LittleEndian>(layer).unwrap();
    buf.write_u32::<LittleEndian>(if dir == Direction::Forward { 0 } else { 1 }).unwrap();
    buf.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
    for (gvid, row) in entries {
        buf.write_u32::<LittleEndian>(*gvid).unwrap();
        for v in row.iter() {
            buf.write_f32::<LittleEndian>(*v).unwrap();
        }
    }
    buf
}

pub struct GhostUpdate {
    pub feat_dim: u32,
    pub layer: u32,
    pub dir: Direction,
    pub entries: Vec<(u32, Vec<f32>)>,
}

pub fn decode_update(bytes: &[u8]) -> EngineResult<GhostUpdate> {
    let mut cur = std::io::Cursor::new(bytes);
    let feat_dim = cur.read_u32::<LittleEndian>()?;
    let layer = cur.read_u32::<LittleEndian>()?;
    let dir = if cur.read_u32::<LittleEndian>()? == 0 { Direction::Forward } else { Direction::Backward };
    let count = cur.read_u32::<LittleEndian>()? as usize;

    let entry_size = 4 + feat_dim as usize * 4;
    let remaining = bytes.len() - GHOST_MSG_HDR;
    if feat_dim == 0 || remaining != count * entry_size {
        return Err(EngineError::ProtocolViolation {
            reason: format!("ghost update body {remaining} bytes does not match count {count} at entry size {entry_size}"),
        });
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let gvid = cur.read_u32::<LittleEndian>()?;
        let mut row = Vec::with_capacity(feat_dim as usize);
        for _ in 0..feat_dim {
            row.push(cur.read_f32::<LittleEndian>()?);
        }
        entries.push((gvid, row));
    }
    Ok(GhostUpdate { feat_dim, layer, dir, entries })
}

/// Applies a decoded ghost update into the destination ghost tensor
/// (`fg` forward, `bg` backward) and bumps the per-(layer,direction) receive
/// counter used by the layer-transition barrier (§4.4).
pub fn apply_update(shard: &GraphShard, update: &GhostUpdate, ghost_tensor: &mut Tensor, recvd: &GhostProgress) -> EngineResult<()> {
    for (gvid, row) in &update.entries {
        let local_row = shard.ghost_row(*gvid)?;
        ghost_tensor.as_array_mut().row_mut(local_row).assign(&ndarray::ArrayView1::from(row.as_slice()));
    }
    recvd.add(update.entries.len() as u32);
    Ok(())
}

/// `ghostVtcsRecvd` for the current (layer, direction), compared against
/// `dstGhostCnt` to decide when the layer-transition barrier may fire.
#[derive(Default)]
pub struct GhostProgress(AtomicU32);

impl GhostProgress {
    pub fn add(&self, n: u32) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn is_complete(&self, expected: u32) -> bool {
        self.get() >= expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn update_round_trips() {
        let entries = [(5u32, [1.0f32, 2.0].as_slice()), (6, [3.0, 4.0].as_slice())];
        let bytes = encode_update(2, 1, Direction::Forward, &entries);
        let decoded = decode_update(&bytes).unwrap();
        assert_eq!(decoded.feat_dim, 2);
        assert_eq!(decoded.layer, 1);
        assert_eq!(decoded.dir, Direction::Forward);
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0], (5, vec![1.0, 2.0]));
    }

    #[test]
    fn decode_rejects_misaligned_body() {
        let mut bytes = encode_update(2, 0, Direction::Forward, &[(1, &[1.0, 2.0])]);
        bytes.pop();
        assert!(decode_update(&bytes).is_err());
    }

    #[test]
    fn apply_update_writes_ghost_row_and_bumps_progress() {
        let shard = GraphShard {
            local_vtx_cnt: 2,
            forward_adj: crate::adjacency::Adjacency { col_ptrs: vec![0, 0, 0], row_indices: vec![], edge_values: vec![] },
            backward_adj: crate::adjacency::Adjacency { col_ptrs: vec![0, 0, 0], row_indices: vec![], edge_values: vec![] },
            norm_factor: vec![1.0, 1.0],
            global_to_ghost: HashMap::from([(42, 2)]),
            dst_ghost_cnt: 1,
            outgoing: std::collections::HashMap::new(),
        };
        let mut ghost_tensor = Tensor::zeros("fg", 1, 2);
        let progress = GhostProgress::default();
        let update = GhostUpdate { feat_dim: 2, layer: 0, dir: Direction::Forward, entries: vec![(42, vec![9.0, 8.0])] };
        apply_update(&shard, &update, &mut ghost_tensor, &progress).unwrap();
        assert_eq!(ghost_tensor.as_array().row(0).to_vec(), vec![9.0, 8.0]);
        assert_eq!(progress.get(), 1);
        assert!(progress.is_complete(1));
    }
}
