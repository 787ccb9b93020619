pub mod adjacency;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod rpc;
pub mod tensor;
pub mod tensor_map;
pub mod weights;
pub mod wire;

pub use error::{EngineError, EngineResult};
pub use tensor::Tensor;
