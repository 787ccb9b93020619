use crate::error::{EngineError, EngineResult};
use crate::ids::ChunkDescriptor;
use crate::ledger::EpochLedger;
use crate::weights::WeightStore;
use crate::wire::{ChunkWire, Op, RequestHeader, TensorHeader, ACK_OK};
use std::sync::Mutex;

pub struct WeightServerState {
    pub store: WeightStore,
    pub ledger: Mutex<EpochLedger>,
}

impl WeightServerState {
    pub fn new(store: WeightStore) -> Self {
        Self { store, ledger: Mutex::new(EpochLedger::default()) }
    }
}

/// Answers one multipart request against the weight store. Unlike the graph
/// server, requests here aren't gated by a timeout table — gradients are
/// additive and idempotence is the caller's concern at the graph-server
/// layer; the weight server's own correctness invariant (§4.3) is purely
/// `localUpdateCount <= expectedTotal` between `info` boundaries.
pub fn handle_request(state: &WeightServerState, frames: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    if frames.len() < 2 {
        return Err(EngineError::ProtocolViolation { reason: "request needs at least header+chunk frames".into() });
    }
    let header = RequestHeader::decode(&frames[0])?;
    let chunk = ChunkWire::decode(&frames[1])?;
    let payload = &frames[2..];

    match header.op {
        Op::Pull => handle_pull(state, &chunk, payload),
        Op::Push => handle_push(state, &chunk, payload),
        Op::Eval => handle_eval(state, &chunk, payload),
        Op::Info => handle_info(state, &chunk, header.field1),
        Op::Term => Ok(vec![ack(ACK_OK)]),
        other => Err(EngineError::ProtocolViolation { reason: format!("op {other:?} not valid on weight server") }),
    }
}

fn ack(v: i32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

fn handle_pull(state: &WeightServerState, chunk: &ChunkDescriptor, payload: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    if state.store.block {
        state.store.wait_until_admitted(chunk, &std::sync::atomic::AtomicBool::new(false));
    }
    let layer = state.store.layer(chunk.layer)?;
    let mut reply = Vec::with_capacity(payload.len() * 2);
    for name_frame in payload {
        let name = String::from_utf8_lossy(name_frame).trim_end_matches('\0').to_string();
        match layer.pull(&name) {
            Ok(value) => {
                reply.push(TensorHeader::ok(&name, value.nrows() as u32, value.ncols() as u32).encode());
                let mut bytes = Vec::with_capacity(value.len() * 4);
                for v in value.iter() {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                reply.push(bytes);
            }
            Err(_) => reply.push(TensorHeader::error(&name).encode()),
        }
    }
    Ok(reply)
}

fn handle_push(state: &WeightServerState, chunk: &ChunkDescriptor, payload: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    let layer = state.store.layer(chunk.layer)?;
    let mut idx = 0;
    while idx + 1 < payload.len() {
        let hdr = TensorHeader::decode(&payload[idx])?;
        let data: Vec<f32> = payload[idx + 1].chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
        let delta = ndarray::Array2::from_shape_vec((hdr.rows as usize, hdr.cols as usize), data)
            .map_err(|e| EngineError::TensorError(e.to_string()))?;
        let applied = layer.push(&hdr.name_str(), &delta, state.store.learning_rate)?;
        if applied.is_some() {
            state.store.epoch.increment();
        }
        idx += 2;
    }
    Ok(vec![ack(ACK_OK)])
}

fn handle_eval(state: &WeightServerState, chunk: &ChunkDescriptor, payload: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    if payload.is_empty() || payload[0].len() != 8 {
        return Err(EngineError::ProtocolViolation { reason: "EVAL payload must be 8 bytes".into() });
    }
    let acc = f32::from_le_bytes(payload[0][0..4].try_into().unwrap());
    let loss = f32::from_le_bytes(payload[0][4..8].try_into().unwrap());
    state.ledger.lock().unwrap().record(chunk.row_count() as u32, acc, loss);
    Ok(vec![Vec::new()])
}

fn handle_info(state: &WeightServerState, chunk: &ChunkDescriptor, expected_total: u32) -> EngineResult<Vec<Vec<u8>>> {
    let layer = state.store.layer(chunk.layer)?;
    for name in ["w", "b"] {
        let _ = layer.info(name, expected_total);
    }
    Ok(vec![ack(ACK_OK)])
}
