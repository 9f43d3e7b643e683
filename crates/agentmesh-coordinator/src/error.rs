//! Error types for the coordination layer.

use std::time::Duration;

use thiserror::Error;

use agentmesh_core::ValidationError;
use agentmesh_poller::TransportError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The ledger refused the operation (e.g. burn exceeds balance).
    #[error("ledger rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("shutdown in progress")]
    ShuttingDown,
}
