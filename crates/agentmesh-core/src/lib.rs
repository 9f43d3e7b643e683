//! agentmesh-core: data model, wire envelope, and rebalance math shared by
//! the poller, the coordinators, and the runtime.
//!
//! Pure library: no async runtime, no IO.

pub mod adjust;
pub mod error;
pub mod types;

pub use error::{AdjustError, ValidationError};
