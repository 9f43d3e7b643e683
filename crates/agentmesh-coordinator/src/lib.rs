//! agentmesh-coordinator: connection handshakes and rebalance governance
//! driven by the poller's message stream.
//!
//! `ConnectionManager` and `ProposalCoordinator` each own their state
//! (single writer), persist it through `Storage` after every mutation, and
//! signal everything else through an injected `EventBus`.

pub mod agent;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event_bus;
pub mod ledger;
pub mod proposal;
pub mod storage;

pub use agent::Agent;
pub use connection::{ConnectionConfig, ConnectionManager};
pub use dispatch::Dispatcher;
pub use error::{CoordinatorError, LedgerError, StorageError};
pub use event_bus::{CoordinationEvent, EventBus, EventKind};
pub use ledger::{LedgerAdapter, MemoryLedger};
pub use proposal::{ExecutionConfig, ProposalCoordinator};
pub use storage::{FileStorage, MemoryStorage, Storage};
