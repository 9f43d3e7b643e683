//! Fan-out of topic batches to agents, gated by durable watermarks.
//!
//! Every batch passes through the [`WatermarkBook`] first, so a message at
//! or below a topic's watermark never reaches an agent again, including
//! across restarts. The watermark is committed and persisted after all
//! agents have handled the batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use agentmesh_poller::types::TopicId;
use agentmesh_poller::{MessageBatch, WatermarkBook};

use crate::agent::Agent;
use crate::error::CoordinatorError;
use crate::storage::{Storage, WATERMARKS_KEY, load_json, save_json};

pub struct Dispatcher {
    agents: Vec<Box<dyn Agent>>,
    watermarks: WatermarkBook,
    storage: Arc<dyn Storage>,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn Storage>) -> Result<Self, CoordinatorError> {
        let watermarks = load_json(storage.as_ref(), WATERMARKS_KEY)?;
        Ok(Self {
            agents: Vec::new(),
            watermarks,
            storage,
        })
    }

    pub fn with_agent(mut self, agent: impl Agent + 'static) -> Self {
        self.agents.push(Box::new(agent));
        self
    }

    pub fn watermark(&self, topic: &TopicId) -> u64 {
        self.watermarks.get(topic)
    }

    /// Union of every agent's watched topics.
    pub fn watched_topics(&self) -> BTreeSet<TopicId> {
        self.agents
            .iter()
            .flat_map(|a| a.watched_topics())
            .collect()
    }

    pub async fn start(&mut self) -> Result<(), CoordinatorError> {
        for agent in &mut self.agents {
            agent.start().await?;
        }
        info!(agents = self.agents.len(), "dispatcher started");
        Ok(())
    }

    /// Deliver the unseen part of `batch` to each agent watching its topic.
    /// Returns the number of messages delivered.
    pub async fn dispatch(&mut self, batch: MessageBatch, now: DateTime<Utc>) -> usize {
        let MessageBatch { topic, messages } = batch;
        let fresh = self.watermarks.admit(&topic, messages);
        let Some(last) = fresh.last().map(|m| m.sequence_number) else {
            debug!(%topic, "batch already processed");
            return 0;
        };
        let count = fresh.len();
        let batch = MessageBatch {
            topic: topic.clone(),
            messages: fresh,
        };

        for agent in &mut self.agents {
            if agent.watched_topics().contains(&topic) {
                agent.handle_batch(&batch, now).await;
            }
        }

        if let Err(e) = self.watermarks.commit(&topic, last) {
            warn!(%topic, error = %e, "watermark not advanced");
        }
        if let Err(e) = save_json(self.storage.as_ref(), WATERMARKS_KEY, &self.watermarks) {
            error!(error = %e, "failed to persist watermarks");
        }
        debug!(%topic, count, watermark = last, "batch dispatched");
        count
    }

    pub async fn maintain(&mut self, now: DateTime<Utc>) {
        for agent in &mut self.agents {
            agent.maintain(now).await;
        }
    }

    pub async fn stop(&mut self) {
        for agent in &mut self.agents {
            agent.stop().await;
            debug!(agent = agent.name(), "agent stopped");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use agentmesh_poller::types::LogMessage;
    use async_trait::async_trait;

    use crate::storage::MemoryStorage;

    /// Records every sequence number it is handed.
    struct Recorder {
        topics: BTreeSet<TopicId>,
        seen: Arc<Mutex<Vec<(TopicId, u64)>>>,
    }

    #[async_trait]
    impl Agent for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn watched_topics(&self) -> BTreeSet<TopicId> {
            self.topics.clone()
        }

        async fn handle_batch(&mut self, batch: &MessageBatch, _now: DateTime<Utc>) {
            let mut seen = self.seen.lock().expect("lock");
            for m in &batch.messages {
                seen.push((batch.topic.clone(), m.sequence_number));
            }
        }
    }

    fn batch(topic: &str, seqs: &[u64]) -> MessageBatch {
        MessageBatch {
            topic: TopicId::new(topic),
            messages: seqs
                .iter()
                .map(|&s| LogMessage {
                    topic_id: TopicId::new(topic),
                    sequence_number: s,
                    consensus_timestamp: Utc::now(),
                    payload: String::new(),
                })
                .collect(),
        }
    }

    fn recorder(topics: &[&str]) -> (Recorder, Arc<Mutex<Vec<(TopicId, u64)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = Recorder {
            topics: topics.iter().map(|t| TopicId::new(*t)).collect(),
            seen: Arc::clone(&seen),
        };
        (r, seen)
    }

    #[tokio::test]
    async fn replayed_batch_reaches_no_handler() {
        let (r, seen) = recorder(&["0.0.1"]);
        let mut d = Dispatcher::new(Arc::new(MemoryStorage::new()))
            .expect("dispatcher")
            .with_agent(r);

        assert_eq!(d.dispatch(batch("0.0.1", &[2, 1, 3]), Utc::now()).await, 3);
        assert_eq!(d.dispatch(batch("0.0.1", &[1, 2, 3]), Utc::now()).await, 0);
        assert_eq!(d.dispatch(batch("0.0.1", &[3, 4]), Utc::now()).await, 1);

        let seqs: Vec<u64> = seen.lock().expect("lock").iter().map(|(_, s)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(d.watermark(&TopicId::new("0.0.1")), 4);
    }

    #[tokio::test]
    async fn batches_go_only_to_watching_agents() {
        let (a, seen_a) = recorder(&["0.0.1"]);
        let (b, seen_b) = recorder(&["0.0.1", "0.0.2"]);
        let mut d = Dispatcher::new(Arc::new(MemoryStorage::new()))
            .expect("dispatcher")
            .with_agent(a)
            .with_agent(b);

        d.dispatch(batch("0.0.2", &[1]), Utc::now()).await;
        assert!(seen_a.lock().expect("lock").is_empty());
        assert_eq!(seen_b.lock().expect("lock").len(), 1);
        assert_eq!(
            d.watched_topics(),
            BTreeSet::from([TopicId::new("0.0.1"), TopicId::new("0.0.2")])
        );
    }

    #[tokio::test]
    async fn watermarks_survive_restart() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let (r, _) = recorder(&["0.0.1"]);
            let mut d = Dispatcher::new(Arc::clone(&storage))
                .expect("dispatcher")
                .with_agent(r);
            d.dispatch(batch("0.0.1", &[1, 2]), Utc::now()).await;
        }

        let (r, seen) = recorder(&["0.0.1"]);
        let mut d = Dispatcher::new(storage).expect("dispatcher").with_agent(r);
        assert_eq!(d.watermark(&TopicId::new("0.0.1")), 2);
        d.dispatch(batch("0.0.1", &[1, 2, 3]), Utc::now()).await;
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }
}
