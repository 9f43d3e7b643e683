//! Per-topic watermarks: the highest sequence number already processed.
//!
//! Consumers pass every polled batch through [`WatermarkBook::admit`] and
//! commit each message after handling it, so a replayed or overlapping batch
//! never reaches a handler twice.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use agentmesh_core::types::{LogMessage, TopicId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatermarkError {
    /// Attempted to move a watermark backward.
    #[error("non-monotonic watermark on {topic}: current={current}, attempted={attempted}")]
    NonMonotonic {
        topic: TopicId,
        current: u64,
        attempted: u64,
    },
}

/// Watermarks for every watched topic. Serializes as a `{topic: seq}` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatermarkBook {
    marks: BTreeMap<TopicId, u64>,
}

impl WatermarkBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watermark for `topic`; 0 if nothing was processed yet.
    pub fn get(&self, topic: &TopicId) -> u64 {
        self.marks.get(topic).copied().unwrap_or(0)
    }

    /// Filter a polled batch down to messages not yet processed, in
    /// increasing sequence order with duplicates removed. Messages that
    /// belong to another topic are discarded.
    pub fn admit(&self, topic: &TopicId, mut batch: Vec<LogMessage>) -> Vec<LogMessage> {
        let mark = self.get(topic);
        batch.retain(|m| &m.topic_id == topic && m.sequence_number > mark);
        batch.sort_by_key(|m| m.sequence_number);
        batch.dedup_by_key(|m| m.sequence_number);
        batch
    }

    /// Record that `topic` has been processed through `sequence`.
    ///
    /// Committing the current value again is a no-op; moving backward is an
    /// error and leaves the watermark unchanged.
    pub fn commit(&mut self, topic: &TopicId, sequence: u64) -> Result<(), WatermarkError> {
        let current = self.get(topic);
        if sequence < current {
            return Err(WatermarkError::NonMonotonic {
                topic: topic.clone(),
                current,
                attempted: sequence,
            });
        }
        self.marks.insert(topic.clone(), sequence);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicId, u64)> {
        self.marks.iter().map(|(t, s)| (t, *s))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
