//! Capability interface shared by every component that consumes topic
//! batches. The run loop only sees `dyn Agent`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use agentmesh_poller::MessageBatch;
use agentmesh_poller::types::TopicId;

use crate::error::CoordinatorError;

#[async_trait]
pub trait Agent: Send {
    /// Short name used in logs and error events.
    fn name(&self) -> &'static str;

    /// Topics whose batches this agent wants. Re-read after every batch,
    /// so the set may grow or shrink as connections come and go.
    fn watched_topics(&self) -> BTreeSet<TopicId>;

    async fn start(&mut self) -> Result<(), CoordinatorError> {
        Ok(())
    }

    /// Handle messages not yet seen on `batch.topic`, in sequence order.
    /// Errors are contained and reported by the agent itself.
    async fn handle_batch(&mut self, batch: &MessageBatch, now: DateTime<Utc>);

    /// Periodic housekeeping, driven by the cleanup timer.
    async fn maintain(&mut self, _now: DateTime<Utc>) {}

    async fn stop(&mut self) {}
}
