use thiserror::Error;

use crate::ids::ChunkDescriptor;

/// Errors surfaced by the pipeline engine, the wire codec, and the weight store.
///
/// Kinds (a)-(e) of the error handling design map onto the variants below:
/// transient network trouble retries at the call site and never reaches here;
/// everything that *does* reach here is either a stale/duplicate message, a
/// protocol violation, an unknown name, or a systemic abort condition.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("chunk {0:?} is not in the timeout table (stale or duplicate response)")]
    StaleChunk(ChunkDescriptor),

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("unknown tensor '{name}' requested")]
    UnknownTensor { name: String },

    #[error("incompatible shapes: expected {expected:?}, found {found:?}")]
    IncompatibleShapes { expected: Vec<usize>, found: Vec<usize> },

    #[error("tensor error: {0}")]
    TensorError(String),

    #[error("graph partition error: {0}")]
    GraphError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("abort limit reached after {consecutive_failures} consecutive failures")]
    AbortLimitReached { consecutive_failures: u32 },

    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
