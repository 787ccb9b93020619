//! Wire framing for the compute-worker RPC protocol (§4.2, §6).
//!
//! All fixed-width integer fields are little-endian via `byteorder`, the
//! same manual-framing idiom used elsewhere in this corpus for hand-rolled
//! binary protocols. Transport is ZeroMQ (`zmq` crate): a bound `REP` socket
//! on the graph server / weight server, multipart messages with the
//! `ZMQ_RCVMORE`-equivalent "more" flag exposed by `Socket::get_rcvmore`.

pub mod codec;
pub mod op;

pub use codec::{ChunkWire, RequestHeader, TensorHeader};
pub use op::Op;

/// Request header size per §6: {op: u32, field1..4: u32}.
pub const HEADER_SIZE: usize = 20;
/// Tensor header size per §6: {status: u32, name[8], rows: u32, cols: u32}.
pub const TENSOR_HDR_SIZE: usize = 24;
/// Sentinel status written into a tensor header to signal "not found" /
/// "stale chunk" errors instead of a normal response.
pub const ERR_STATUS: u32 = u32::MAX;
/// Ack carried in a PUSH/PUSHE/FIN response: chunk accepted.
pub const ACK_OK: i32 = 0;
/// Ack carried in a PUSH/PUSHE/FIN response: chunk discarded (stale/duplicate).
pub const ACK_DISCARDED: i32 = -1;

/// Default max outbound ghost-update message size (5 MiB), per §4.1.3.
pub const MAX_MSG_SIZE: usize = 5 * 1024 * 1024;
