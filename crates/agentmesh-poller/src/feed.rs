//! Topic feeds: pull-based message batches per topic.
//!
//! A feed owns a fetch cursor for one topic and reads through the shared
//! [`RateLimitedPoller`]. [`spawn_feed`] drives a feed on a fixed interval and
//! pushes non-empty batches into a channel that consumers iterate. Retrying
//! is the producer's job; consumers only ever see ordered batches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use agentmesh_core::types::{LogMessage, TopicId};

use crate::poller::RateLimitedPoller;
use crate::transport::{LogTransport, TransportError};

/// Ordered messages from one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub topic: TopicId,
    pub messages: Vec<LogMessage>,
}

pub struct TopicFeed {
    topic: TopicId,
    /// Highest sequence number handed to the consumer.
    fetched: u64,
    poller: RateLimitedPoller<Vec<LogMessage>>,
    transport: Arc<dyn LogTransport>,
}

impl TopicFeed {
    pub fn new(
        topic: TopicId,
        since: u64,
        poller: RateLimitedPoller<Vec<LogMessage>>,
        transport: Arc<dyn LogTransport>,
    ) -> Self {
        Self {
            topic,
            fetched: since,
            poller,
            transport,
        }
    }

    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Poll once. Returns messages newer than the fetch cursor, sorted by
    /// sequence number, and advances the cursor past them.
    pub async fn next_batch(&mut self) -> Result<Vec<LogMessage>, TransportError> {
        let since = self.fetched;
        let topic = self.topic.clone();
        let transport = Arc::clone(&self.transport);

        let mut messages = self
            .poller
            .enqueue(topic.clone(), format!("since:{since}"), move || {
                let transport = Arc::clone(&transport);
                let topic = topic.clone();
                async move { transport.poll(&topic, since).await }
            })
            .await?;

        messages.retain(|m| m.sequence_number > since);
        messages.sort_by_key(|m| m.sequence_number);
        messages.dedup_by_key(|m| m.sequence_number);

        if let Some(last) = messages.last() {
            self.fetched = last.sequence_number;
        }
        Ok(messages)
    }
}

/// Poll `feed` every `every` until `cancel` fires or the consumer hangs up.
///
/// An invalid topic ends the feed; any other error is logged and the next
/// tick tries again.
pub fn spawn_feed(
    mut feed: TopicFeed,
    every: Duration,
    tx: mpsc::Sender<MessageBatch>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match feed.next_batch().await {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    debug!(topic = %feed.topic, count = messages.len(), "feed batch");
                    let batch = MessageBatch {
                        topic: feed.topic.clone(),
                        messages,
                    };
                    if tx.send(batch).await.is_err() {
                        break;
                    }
                }
                Err(TransportError::InvalidTopic(topic)) => {
                    error!(%topic, "topic is invalid, stopping feed");
                    break;
                }
                Err(e) => warn!(topic = %feed.topic, error = %e, "feed poll failed"),
            }
        }
        debug!(topic = %feed.topic, "feed stopped");
    })
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLog;
    use crate::poller::PollerConfig;

    fn setup() -> (Arc<MemoryLog>, RateLimitedPoller<Vec<LogMessage>>, TopicId) {
        let log = Arc::new(MemoryLog::with_topics(&["0.0.10"]));
        let poller = RateLimitedPoller::new(PollerConfig {
            cache_ttl: Duration::ZERO,
            ..PollerConfig::default()
        });
        (log, poller, TopicId::new("0.0.10"))
    }

    #[tokio::test]
    async fn next_batch_advances_cursor() {
        let (log, poller, topic) = setup();
        log.append(&topic, "a".into()).expect("append");
        log.append(&topic, "b".into()).expect("append");

        let mut feed = TopicFeed::new(topic.clone(), 0, poller, log.clone());
        let batch = feed.next_batch().await.expect("poll");
        assert_eq!(batch.len(), 2);
        assert_eq!(feed.fetched(), 2);

        assert!(feed.next_batch().await.expect("poll").is_empty());

        log.append(&topic, "c".into()).expect("append");
        let batch = feed.next_batch().await.expect("poll");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "c");
    }

    #[tokio::test]
    async fn resumes_from_given_watermark() {
        let (log, poller, topic) = setup();
        for p in ["a", "b", "c"] {
            log.append(&topic, p.into()).expect("append");
        }
        let mut feed = TopicFeed::new(topic, 2, poller, log);
        let batch = feed.next_batch().await.expect("poll");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sequence_number, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_poll_is_invisible_to_feed() {
        let (log, poller, topic) = setup();
        log.append(&topic, "a".into()).expect("append");
        log.fail_next_poll(&topic, TransportError::RateLimited(topic.clone()));

        let mut feed = TopicFeed::new(topic.clone(), 0, poller, log.clone());
        let batch = feed.next_batch().await.expect("rate limit absorbed");
        assert_eq!(batch.len(), 1);
        assert_eq!(log.poll_calls(&topic), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_feed_delivers_batches_and_stops_on_cancel() {
        let (log, poller, topic) = setup();
        log.append(&topic, "a".into()).expect("append");

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let feed = TopicFeed::new(topic.clone(), 0, poller, log.clone());
        let handle = spawn_feed(feed, Duration::from_secs(10), tx, cancel.clone());

        let batch = rx.recv().await.expect("first batch");
        assert_eq!(batch.topic, topic);
        assert_eq!(batch.messages.len(), 1);

        log.append(&topic, "b".into()).expect("append");
        let batch = rx.recv().await.expect("second batch");
        assert_eq!(batch.messages[0].payload, "b");

        cancel.cancel();
        handle.await.expect("feed task ends");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_topic_ends_feed() {
        let log = Arc::new(MemoryLog::new());
        let poller = RateLimitedPoller::new(PollerConfig::default());
        let (tx, mut rx) = mpsc::channel(1);
        let feed = TopicFeed::new(TopicId::new("0.0.404"), 0, poller, log);

        let handle = spawn_feed(feed, Duration::from_secs(1), tx, CancellationToken::new());
        handle.await.expect("feed task ends by itself");
        assert!(rx.recv().await.is_none());
    }
}
