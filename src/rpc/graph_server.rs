use std::sync::Mutex;

use crate::adjacency::GraphShard;
use crate::engine::Scheduler;
use crate::error::{EngineError, EngineResult};
use crate::ids::ChunkDescriptor;
use crate::ledger::EpochLedger;
use crate::tensor::Tensor;
use crate::tensor_map::LayeredTensorMaps;
use crate::wire::{ChunkWire, Op, RequestHeader, TensorHeader, ACK_DISCARDED, ACK_OK};

/// Everything one graph server process needs to answer compute-worker RPCs:
/// the vertex shard, the per-layer tensor maps (including ghost tensors,
/// stored under their own names in the same map), the scheduler (owns the
/// timeout table and chunk queues), and the running accuracy/loss ledger.
pub struct GraphServerState {
    pub shard: GraphShard,
    pub tensors: Mutex<LayeredTensorMaps>,
    pub scheduler: Scheduler,
    pub ledger: Mutex<EpochLedger>,
}

impl GraphServerState {
    pub fn new(shard: GraphShard, num_layers: u32, scheduler: Scheduler) -> Self {
        Self {
            shard,
            tensors: Mutex::new(LayeredTensorMaps::with_layers(num_layers as usize)),
            scheduler,
            ledger: Mutex::new(EpochLedger::default()),
        }
    }
}

/// Parses and answers one multipart request. `frames[0]` is the
/// `RequestHeader`, `frames[1]` the `ChunkWire`-encoded chunk, the rest are
/// op-specific payload frames. Returns the reply frames to send back.
pub fn handle_request(state: &GraphServerState, frames: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    if frames.len() < 2 {
        return Err(EngineError::ProtocolViolation { reason: "request needs at least header+chunk frames".into() });
    }
    let header = RequestHeader::decode(&frames[0])?;
    let chunk = ChunkWire::decode(&frames[1])?;
    let payload = &frames[2..];

    // Timeout-table discipline: every handler's first action is a
    // lock-protected membership check (§4.2). TERM is exempt — it isn't
    // chunk-scoped.
    if header.op != Op::Term && !state.scheduler.timeout_table.contains(&chunk) {
        tracing::warn!(?chunk, op = ?header.op, "stale or duplicate request, draining and nacking");
        return Ok(vec![ack_frame(ACK_DISCARDED)]);
    }

    match header.op {
        Op::Pull => handle_pull(state, &chunk, header.field1, payload),
        Op::Push => handle_push(state, &chunk, header.field1, payload),
        Op::Eval => handle_eval(state, &chunk, payload),
        Op::Fin => handle_fin(state, &chunk),
        Op::Term => Ok(vec![ack_frame(ACK_OK)]),
        other => Err(EngineError::ProtocolViolation { reason: format!("op {other:?} not valid on graph server") }),
    }
}

fn ack_frame(ack: i32) -> Vec<u8> {
    ack.to_le_bytes().to_vec()
}

fn handle_pull(state: &GraphServerState, chunk: &ChunkDescriptor, count: u32, payload: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    let tensors = state.tensors.lock().unwrap();
    let layer = tensors.layer(chunk.feat_layer())?;
    let mut reply = Vec::with_capacity(payload.len() * 2);
    for name_frame in payload.iter().take(count as usize) {
        let name = String::from_utf8_lossy(name_frame).trim_end_matches('\0').to_string();
        match layer.get(&name) {
            Ok(tensor) => {
                let (lo, hi) = (chunk.low_bound as usize, chunk.up_bound as usize);
                let slice = tensor.row_slice(lo.min(tensor.rows()), hi.min(tensor.rows()));
                reply.push(TensorHeader::ok(&name, slice.nrows() as u32, slice.ncols() as u32).encode());
                let mut bytes = Vec::with_capacity(slice.len() * 4);
                for v in slice.iter() {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                reply.push(bytes);
            }
            Err(_) => reply.push(TensorHeader::error(&name).encode()),
        }
    }
    Ok(reply)
}

fn handle_push(state: &GraphServerState, chunk: &ChunkDescriptor, count: u32, payload: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    let mut tensors = state.tensors.lock().unwrap();
    let layer = tensors.layer_mut(chunk.feat_layer())?;
    let (lo, hi) = (chunk.low_bound as usize, chunk.up_bound as usize);
    let total_rows = state.shard.local_vtx_cnt as usize;

    let mut idx = 0;
    for _ in 0..count {
        let hdr = TensorHeader::decode(&payload[idx])?;
        let data_bytes = &payload[idx + 1];
        idx += 2;
        let rows = hdr.rows as usize;
        let cols = hdr.cols as usize;
        let mut data = Vec::with_capacity(rows * cols);
        for chunk4 in data_bytes.chunks_exact(4) {
            data.push(f32::from_le_bytes(chunk4.try_into().unwrap()));
        }
        let name = hdr.name_str();
        let written = Tensor::new(&name, rows, cols, data)?;
        let dest = layer.get_or_alloc(&name, total_rows, cols);
        dest.row_slice_mut(lo, hi).assign(written.as_array());
    }
    drop(tensors);

    // First-response-wins: only the request that actually removes the chunk
    // from the table gets to report success.
    if state.scheduler.timeout_table.remove(chunk) {
        state.scheduler.advance(*chunk);
        Ok(vec![ack_frame(ACK_OK)])
    } else {
        Ok(vec![ack_frame(ACK_DISCARDED)])
    }
}

fn handle_eval(state: &GraphServerState, chunk: &ChunkDescriptor, payload: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    if payload.is_empty() || payload[0].len() != 8 {
        return Err(EngineError::ProtocolViolation { reason: "EVAL payload must be 8 bytes (acc, loss)".into() });
    }
    let acc = f32::from_le_bytes(payload[0][0..4].try_into().unwrap());
    let loss = f32::from_le_bytes(payload[0][4..8].try_into().unwrap());
    state.ledger.lock().unwrap().record(chunk.row_count() as u32, acc, loss);
    // EVAL has no logical response (§6); ZeroMQ REP still requires a reply
    // frame to unblock the socket, so send an empty one.
    Ok(vec![Vec::new()])
}

fn handle_fin(state: &GraphServerState, chunk: &ChunkDescriptor) -> EngineResult<Vec<Vec<u8>>> {
    state.scheduler.timeout_table.remove(chunk);
    Ok(vec![ack_frame(ACK_OK)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjacency::Adjacency;
    use crate::engine::{Scheduler, Staleness};
    use crate::ids::Direction;
    use std::collections::HashMap;

    fn toy_state() -> GraphServerState {
        let shard = GraphShard {
            local_vtx_cnt: 2,
            forward_adj: Adjacency { col_ptrs: vec![0, 0, 0], row_indices: vec![], edge_values: vec![] },
            backward_adj: Adjacency { col_ptrs: vec![0, 0, 0], row_indices: vec![], edge_values: vec![] },
            norm_factor: vec![1.0, 1.0],
            global_to_ghost: HashMap::new(),
            dst_ghost_cnt: 0,
            outgoing: std::collections::HashMap::new(),
        };
        let scheduler = Scheduler::new(1, 1, 2, Staleness::Unbounded, 1);
        GraphServerState::new(shard, 1, scheduler)
    }

    #[test]
    fn pull_returns_error_header_for_unknown_tensor() {
        let state = toy_state();
        let chunk = ChunkDescriptor::new(0, 1, 0, 0, 2, 0, Direction::Forward, 0);
        state.scheduler.timeout_table.insert(chunk);
        let header = RequestHeader::new(Op::Pull, 1).encode();
        let chunk_bytes = ChunkWire::encode(&chunk);
        let name_frame = b"zzz\0\0\0\0\0".to_vec();
        let reply = handle_request(&state, &[header, chunk_bytes, name_frame]).unwrap();
        let hdr = TensorHeader::decode(&reply[0]).unwrap();
        assert!(hdr.is_error());
    }

    #[test]
    fn stale_chunk_is_discarded_without_touching_state() {
        let state = toy_state();
        let chunk = ChunkDescriptor::new(0, 1, 0, 0, 2, 0, Direction::Forward, 0);
        // never inserted into timeout table: simulates a duplicate after first-response-wins removal.
        let header = RequestHeader::new(Op::Fin, 0).encode();
        let reply = handle_request(&state, &[header, ChunkWire::encode(&chunk)]).unwrap();
        assert_eq!(i32::from_le_bytes(reply[0].clone().try_into().unwrap()), ACK_DISCARDED);
    }

    #[test]
    fn push_then_duplicate_push_is_discarded() {
        let state = toy_state();
        let chunk = ChunkDescriptor::new(0, 1, 0, 0, 2, 0, Direction::Forward, 0);
        state.scheduler.timeout_table.insert(chunk);

        let header = RequestHeader::new(Op::Push, 1).encode();
        let tensor_hdr = TensorHeader::ok("h", 2, 1).encode();
        let data = vec![1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
        let frames = vec![header.clone(), ChunkWire::encode(&chunk), tensor_hdr.clone(), data.clone()];
        let reply = handle_request(&state, &frames).unwrap();
        assert_eq!(i32::from_le_bytes(reply[0].clone().try_into().unwrap()), ACK_OK);

        // chunk was removed from the timeout table by the first push; this one must be discarded.
        let frames2 = vec![header, ChunkWire::encode(&chunk), tensor_hdr, data];
        let reply2 = handle_request(&state, &frames2).unwrap();
        assert_eq!(i32::from_le_bytes(reply2[0].clone().try_into().unwrap()), ACK_DISCARDED);
    }
}
