//! In-process log with fault injection. Used by tests across the workspace
//! and by any local run that does not need durability.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use agentmesh_core::types::{Envelope, LogMessage, TopicId};

use crate::transport::{LogTransport, TransportError};

/// First id handed out by `create_topic`.
const FIRST_CREATED_TOPIC: u64 = 9_000;

#[derive(Debug, Default)]
struct Inner {
    topics: BTreeMap<TopicId, Vec<LogMessage>>,
    created: u64,
    poll_faults: HashMap<TopicId, VecDeque<TransportError>>,
    publish_faults: HashMap<TopicId, VecDeque<TransportError>>,
    create_faults: VecDeque<TransportError>,
    poll_calls: HashMap<TopicId, usize>,
}

/// Append-only topics held in memory. Unknown topics are `InvalidTopic` for
/// both reads and writes; create them with [`MemoryLog::ensure_topic`] or
/// [`LogTransport::create_topic`].
#[derive(Debug, Default)]
pub struct MemoryLog {
    inner: Mutex<Inner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics(topics: &[&str]) -> Self {
        let log = Self::new();
        for t in topics {
            log.ensure_topic(&TopicId::new(*t));
        }
        log
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ensure_topic(&self, topic: &TopicId) {
        self.lock().topics.entry(topic.clone()).or_default();
    }

    /// Every message written to `topic`, in order.
    pub fn messages(&self, topic: &TopicId) -> Vec<LogMessage> {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Every message on `topic` that decodes as an envelope.
    pub fn envelopes(&self, topic: &TopicId) -> Vec<Envelope> {
        self.messages(topic)
            .iter()
            .filter_map(|m| m.envelope().ok())
            .collect()
    }

    /// Make the next poll of `topic` fail with `err`. Faults queue up.
    pub fn fail_next_poll(&self, topic: &TopicId, err: TransportError) {
        self.lock()
            .poll_faults
            .entry(topic.clone())
            .or_default()
            .push_back(err);
    }

    /// Make the next publish to `topic` fail with `err`. Faults queue up.
    pub fn fail_next_publish(&self, topic: &TopicId, err: TransportError) {
        self.lock()
            .publish_faults
            .entry(topic.clone())
            .or_default()
            .push_back(err);
    }

    /// Make the next `create_topic` fail with `err`.
    pub fn fail_next_create(&self, err: TransportError) {
        self.lock().create_faults.push_back(err);
    }

    /// Number of poll requests that reached the log for `topic`.
    pub fn poll_calls(&self, topic: &TopicId) -> usize {
        self.lock().poll_calls.get(topic).copied().unwrap_or(0)
    }

    /// Append without going through the transport (simulates a peer).
    pub fn append(&self, topic: &TopicId, payload: String) -> Result<u64, TransportError> {
        let mut inner = self.lock();
        let entries = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::InvalidTopic(topic.clone()))?;
        let sequence_number = entries.last().map_or(1, |m| m.sequence_number + 1);
        entries.push(LogMessage {
            topic_id: topic.clone(),
            sequence_number,
            consensus_timestamp: Utc::now(),
            payload,
        });
        Ok(sequence_number)
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn publish(&self, topic: &TopicId, payload: String) -> Result<u64, TransportError> {
        let fault = self
            .lock()
            .publish_faults
            .get_mut(topic)
            .and_then(VecDeque::pop_front);
        if let Some(err) = fault {
            return Err(err);
        }
        self.append(topic, payload)
    }

    async fn poll(&self, topic: &TopicId, since: u64) -> Result<Vec<LogMessage>, TransportError> {
        let mut inner = self.lock();
        *inner.poll_calls.entry(topic.clone()).or_default() += 1;
        if let Some(err) = inner.poll_faults.get_mut(topic).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        let entries = inner
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::InvalidTopic(topic.clone()))?;
        Ok(entries
            .iter()
            .filter(|m| m.sequence_number > since)
            .cloned()
            .collect())
    }

    async fn create_topic(&self, _memo: &str) -> Result<TopicId, TransportError> {
        let mut inner = self.lock();
        if let Some(err) = inner.create_faults.pop_front() {
            return Err(err);
        }
        inner.created += 1;
        let topic = TopicId::new(format!("0.0.{}", FIRST_CREATED_TOPIC + inner.created));
        inner.topics.insert(topic.clone(), Vec::new());
        Ok(topic)
    }
}
