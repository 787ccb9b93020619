//! The per-machine pipeline engine (§4.1, §5): scheduler, gather/scatter
//! kernels, ghost exchange, and the timeout-table/backoff machinery shared
//! with the RPC layer.

pub mod barrier;
pub mod gather;
pub mod ghost;
pub mod queue;
pub mod scatter;
pub mod scheduler;
pub mod timeout_table;

pub use scheduler::{Scheduler, Stage, Staleness};
pub use timeout_table::{Deadline, RelaunchBackoff, TimeoutTable};
