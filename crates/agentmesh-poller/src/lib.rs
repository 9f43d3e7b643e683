//! agentmesh-poller: turns the log's pull-only, rate-limited interface into
//! an ordered, deduplicated message stream per topic.
//!
//! Read path: `LogTransport` → `RateLimitedPoller` (per-topic FIFO, backoff,
//! TTL cache) → `TopicFeed` (per-topic fetch cursor) → consumers, which
//! gate delivery through a `WatermarkBook`.

pub mod backoff;
pub mod cache;
pub mod feed;
pub mod memory;
pub mod poller;
pub mod transport;
pub mod watermark;

pub use agentmesh_core::types;
pub use feed::{MessageBatch, TopicFeed, spawn_feed};
pub use memory::MemoryLog;
pub use poller::{PollerConfig, RateLimitedPoller};
pub use transport::{LogTransport, TransportError};
pub use watermark::{WatermarkBook, WatermarkError};
