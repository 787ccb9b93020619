//! The RPC surfaces (§4.2, §6): graph-server and weight-server request
//! handlers, and the compute-worker client that drives both.

pub mod graph_server;
pub mod weight_server;
pub mod worker_client;

pub use graph_server::GraphServerState;
pub use weight_server::WeightServerState;
