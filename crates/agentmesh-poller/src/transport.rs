//! Boundary to the external append-only log service.

use async_trait::async_trait;
use thiserror::Error;

use agentmesh_core::types::{LogMessage, TopicId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The log rejected the request for exceeding its rate limit.
    #[error("rate limited on topic {0}")]
    RateLimited(TopicId),

    #[error("log request timed out: {0}")]
    Timeout(String),

    /// The topic does not exist or cannot be accessed. Never retried.
    #[error("invalid topic {0}")]
    InvalidTopic(TopicId),

    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("log codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Timeouts and rate limits may succeed on retry; everything else will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Timeout(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Thin interface to the log. Implementations must return messages of one
/// topic in log order; they need not filter duplicates.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Append `payload` to `topic`, returning the assigned sequence number.
    async fn publish(&self, topic: &TopicId, payload: String) -> Result<u64, TransportError>;

    /// Messages of `topic` with sequence number greater than `since`.
    async fn poll(&self, topic: &TopicId, since: u64) -> Result<Vec<LogMessage>, TransportError>;

    /// Open a new topic, e.g. a dedicated connection topic.
    async fn create_topic(&self, memo: &str) -> Result<TopicId, TransportError>;
}
