use ndarray::Array2;

use crate::backend::{default_backend, Backend};
use crate::dispatch::{ApplyRole, WorkerEndpoints};
use crate::engine::RelaunchBackoff;
use crate::error::{EngineError, EngineResult};
use crate::ids::ChunkDescriptor;
use crate::wire::{ChunkWire, Op, RequestHeader, TensorHeader};

/// One compute worker's full lifecycle for a single chunk: connect, pull
/// inputs, run one layer's math on the reference CPU backend, push outputs,
/// report eval on the final forward layer, then FIN. Retries PULLs with the
/// worker-side adaptive backoff (§4.2) when the graph server has no tensor
/// ready yet.
pub fn run_once(
    endpoints: &WorkerEndpoints,
    chunk: ChunkDescriptor,
    layer_dims: (usize, usize),
    role: ApplyRole,
) -> EngineResult<()> {
    let ctx = zmq::Context::new();
    let gs = ctx.socket(zmq::REQ)?;
    gs.connect(&endpoints.graph_server_addr)?;
    let ws = ctx.socket(zmq::REQ)?;
    ws.connect(&endpoints.weight_server_addr)?;

    let backend = default_backend();
    let (in_dim, out_dim) = layer_dims;

    let gathered_name = match chunk.direction {
        crate::ids::Direction::Forward => "ah",
        crate::ids::Direction::Backward => "aTg",
    };
    let gathered = pull_one(&gs, &chunk, gathered_name)?;
    let weight = pull_one(&ws, &chunk, "w")?;
    let rows = gathered.nrows();
    if gathered.ncols() != in_dim || weight.nrows() != in_dim || weight.ncols() != out_dim {
        return Err(EngineError::IncompatibleShapes {
            expected: vec![in_dim, out_dim],
            found: vec![gathered.ncols(), weight.nrows(), weight.ncols()],
        });
    }

    match role {
        ApplyRole::ForwardHidden => {
            let z = backend.matmul_t(&gathered, &weight, false, false)?;
            let h = backend.tanh(&z)?;
            push_many(&gs, &chunk, &[("z", &z), ("h", &h)])?;
        }
        ApplyRole::ForwardFinal => {
            let z = backend.matmul_t(&gathered, &weight, false, false)?;
            let probs = backend.softmax_rows(&z)?;
            let labels = pull_one(&gs, &chunk, "lab")?;
            let (acc, loss) = backend.cross_entropy(&probs, &labels)?;
            let grad = backend.cross_entropy_grad(&probs, &labels)?;
            let grad_w = backend.matmul_t(&gathered, &grad, true, false)?;
            push_many(&gs, &chunk, &[("h", &probs), ("grad", &grad)])?;
            push_many(&ws, &chunk, &[("w", &grad_w)])?;
            send_eval(&gs, &chunk, acc, loss)?;
        }
        ApplyRole::Backward => {
            let grad_in = pull_one(&gs, &chunk, "grad")?;
            let h = pull_one(&gs, &chunk, "h")?;
            let grad_hidden = backend.tanh_backward(&h, &grad_in)?;
            let grad_w = backend.matmul_t(&gathered, &grad_hidden, true, false)?;
            let grad_out = backend.matmul_t(&grad_hidden, &weight, false, true)?;
            push_many(&gs, &chunk, &[("grad", &grad_out)])?;
            push_many(&ws, &chunk, &[("w", &grad_w)])?;
        }
        ApplyRole::Edge => {
            // No shipped GNN variant produces edge-NN chunks; the RPC
            // surface exists so a future variant has somewhere to dispatch.
            return Err(EngineError::ProtocolViolation { reason: "edge-NN apply not implemented".into() });
        }
    }

    let _ = rows;
    send_fin(&gs, &chunk)
}

fn pull_one(socket: &zmq::Socket, chunk: &ChunkDescriptor, name: &str) -> EngineResult<Array2<f32>> {
    let mut backoff = RelaunchBackoff::worker_default();
    loop {
        let header = RequestHeader::new(Op::Pull, 1).encode();
        let name_frame = pad_name(name);
        socket.send_multipart([header, ChunkWire::encode(chunk), name_frame], 0)?;
        let reply = socket.recv_multipart(0)?;
        if reply.len() < 2 {
            return Err(EngineError::ProtocolViolation { reason: "pull reply missing tensor frames".into() });
        }
        let hdr = TensorHeader::decode(&reply[0])?;
        if hdr.is_error() {
            if let Some(wait) = backoff.record_failure() {
                std::thread::sleep(wait);
                continue;
            }
            return Err(EngineError::UnknownTensor { name: name.to_string() });
        }
        backoff.record_success();
        let data: Vec<f32> = reply[1].chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
        return Array2::from_shape_vec((hdr.rows as usize, hdr.cols as usize), data)
            .map_err(|e| EngineError::TensorError(e.to_string()));
    }
}

fn push_many(socket: &zmq::Socket, chunk: &ChunkDescriptor, tensors: &[(&str, &Array2<f32>)]) -> EngineResult<()> {
    let header = RequestHeader::new(Op::Push, tensors.len() as u32).encode();
    let mut frames = vec![header, ChunkWire::encode(chunk)];
    for (name, arr) in tensors {
        frames.push(TensorHeader::ok(name, arr.nrows() as u32, arr.ncols() as u32).encode());
        let mut bytes = Vec::with_capacity(arr.len() * 4);
        for v in arr.iter() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        frames.push(bytes);
    }
    socket.send_multipart(frames, 0)?;
    let reply = socket.recv_multipart(0)?;
    let ack = i32::from_le_bytes(reply[0].as_slice().try_into().map_err(|_| EngineError::ProtocolViolation {
        reason: "push ack must be 4 bytes".into(),
    })?);
    if ack != crate::wire::ACK_OK {
        return Err(EngineError::StaleChunk(*chunk));
    }
    Ok(())
}

fn send_eval(socket: &zmq::Socket, chunk: &ChunkDescriptor, acc: f32, loss: f32) -> EngineResult<()> {
    let header = RequestHeader::new(Op::Eval, 0).encode();
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&acc.to_le_bytes());
    payload.extend_from_slice(&loss.to_le_bytes());
    socket.send_multipart([header, ChunkWire::encode(chunk), payload], 0)?;
    socket.recv_multipart(0)?;
    Ok(())
}

fn send_fin(socket: &zmq::Socket, chunk: &ChunkDescriptor) -> EngineResult<()> {
    let header = RequestHeader::new(Op::Fin, 0).encode();
    socket.send_multipart([header, ChunkWire::encode(chunk)], 0)?;
    socket.recv_multipart(0)?;
    Ok(())
}

fn pad_name(name: &str) -> Vec<u8> {
    let mut buf = [0u8; crate::tensor::TENSOR_NAME_LEN];
    let n = name.len().min(buf.len());
    buf[..n].copy_from_slice(&name.as_bytes()[..n]);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_name_nul_pads_short_names() {
        let b = pad_name("h");
        assert_eq!(b.len(), crate::tensor::TENSOR_NAME_LEN);
        assert_eq!(b[0], b'h');
        assert_eq!(b[1], 0);
    }
}
