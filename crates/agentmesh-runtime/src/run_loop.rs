//! `agentmesh run`: wires the file log, storage, bus, ledger and both agents
//! together, then drives them from per-topic feeds until a shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentmesh_coordinator::{
    ConnectionManager, CoordinationEvent, Dispatcher, EventBus, EventKind, FileStorage,
    MemoryLedger, ProposalCoordinator,
};
use agentmesh_core::types::{LogMessage, TopicId};
use agentmesh_poller::{LogTransport, MessageBatch, RateLimitedPoller, TopicFeed, spawn_feed};

use crate::config::Settings;
use crate::file_log::FileLogTransport;

/// Capacity of the feed → dispatcher channel.
const BATCH_CHANNEL: usize = 64;

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let transport = Arc::new(
        FileLogTransport::open(&settings.log_dir)
            .with_context(|| format!("opening log dir {}", settings.log_dir.display()))?,
    );
    for topic in &settings.governance_topics {
        transport
            .ensure_topic(topic)
            .with_context(|| format!("creating topic {topic}"))?;
    }
    let storage = Arc::new(
        FileStorage::open(&settings.state_dir)
            .with_context(|| format!("opening state dir {}", settings.state_dir.display()))?,
    );
    let bus = Arc::new(EventBus::new());
    log_events(&bus);
    let ledger = Arc::new(MemoryLedger::new(settings.balances.clone()));
    let shutdown = CancellationToken::new();

    let mut connections = ConnectionManager::new(
        settings.identity.clone(),
        transport.clone(),
        storage.clone(),
        Arc::clone(&bus),
        settings.connections,
    )?;
    for peer in &settings.peers {
        match connections
            .request_connection(peer.topic_id.clone(), peer.account_id.clone(), Utc::now())
            .await
        {
            Ok(id) => info!(connection_id = id, %peer, "connection requested"),
            Err(e) => warn!(%peer, error = %e, "connection request failed"),
        }
    }

    let proposals = ProposalCoordinator::new(
        settings.identity.clone(),
        transport.clone(),
        storage.clone(),
        Arc::clone(&bus),
        ledger,
        settings.execution,
    )?
    .with_governance_topics(settings.governance_topics.iter().cloned())
    .with_shutdown(shutdown.clone());
    proposals.track_connection_topics(connections.established_topics());

    let mut dispatcher = Dispatcher::new(storage)?
        .with_agent(connections)
        .with_agent(proposals);
    dispatcher.start().await?;

    let poller = RateLimitedPoller::<Vec<LogMessage>>::new(settings.poller);
    let sweeper = poller.spawn_cache_sweeper(settings.cache_sweep, shutdown.child_token());

    let (tx, mut rx) = mpsc::channel(BATCH_CHANNEL);
    let mut feeds = FeedSet {
        transport,
        poller,
        every: settings.poll_interval,
        tx,
        cancel: shutdown.clone(),
        running: HashMap::new(),
        stopped: Vec::new(),
    };
    feeds.reconcile(&dispatcher);

    let signals = tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut cleanup = interval(settings.cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        identity = %settings.identity,
        poll_interval_secs = settings.poll_interval.as_secs(),
        "agent running"
    );

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            batch = rx.recv() => {
                let Some(batch) = batch else {
                    warn!("all feeds stopped");
                    break;
                };
                dispatcher.dispatch(batch, Utc::now()).await;
                feeds.reconcile(&dispatcher);
            }
            _ = cleanup.tick() => {
                dispatcher.maintain(Utc::now()).await;
                feeds.reconcile(&dispatcher);
            }
        }
    }

    shutdown.cancel();
    dispatcher.stop().await;
    feeds.join().await;
    let _ = sweeper.await;
    signals.abort();
    info!("agent stopped");
    Ok(())
}

// ─── Feeds ───────────────────────────────────────────────────────────

/// One polling task per watched topic. Topics no agent watches any more are
/// stopped; a feed that ended on its own (invalid topic) is not restarted.
struct FeedSet {
    transport: Arc<FileLogTransport>,
    poller: RateLimitedPoller<Vec<LogMessage>>,
    every: Duration,
    tx: mpsc::Sender<MessageBatch>,
    cancel: CancellationToken,
    running: HashMap<TopicId, (CancellationToken, JoinHandle<()>)>,
    stopped: Vec<JoinHandle<()>>,
}

impl FeedSet {
    fn reconcile(&mut self, dispatcher: &Dispatcher) {
        let watched = dispatcher.watched_topics();

        let unwatched: Vec<TopicId> = self
            .running
            .keys()
            .filter(|t| !watched.contains(*t))
            .cloned()
            .collect();
        for topic in unwatched {
            if let Some((token, handle)) = self.running.remove(&topic) {
                debug!(%topic, "stopping feed");
                token.cancel();
                self.stopped.push(handle);
            }
        }

        for topic in watched {
            if self.running.contains_key(&topic) {
                continue;
            }
            let since = dispatcher.watermark(&topic);
            let transport: Arc<dyn LogTransport> = self.transport.clone();
            let feed = TopicFeed::new(topic.clone(), since, self.poller.clone(), transport);
            let token = self.cancel.child_token();
            let handle = spawn_feed(feed, self.every, self.tx.clone(), token.clone());
            info!(%topic, since, "feed started");
            self.running.insert(topic, (token, handle));
        }
    }

    async fn join(self) {
        let handles = self
            .running
            .into_values()
            .map(|(_, h)| h)
            .chain(self.stopped);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "feed task failed");
            }
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────

fn log_events(bus: &EventBus) {
    for kind in EventKind::ALL {
        bus.on(kind, |ev| {
            match ev {
                CoordinationEvent::ConnectionRequested { connection }
                | CoordinationEvent::ConnectionEstablished { connection }
                | CoordinationEvent::ConnectionClosed { connection } => info!(
                    event = %ev.kind(),
                    connection_id = connection.id,
                    peer = %connection.peer_topic_id,
                    topic = ?connection.connection_topic_id,
                    reason = ?connection.close_reason,
                    "connection event"
                ),
                CoordinationEvent::ProposalReceived { proposal }
                | CoordinationEvent::ProposalFailed { proposal } => info!(
                    event = %ev.kind(),
                    proposal_id = %proposal.id,
                    error = ?proposal.error,
                    "proposal event"
                ),
                CoordinationEvent::ProposalExecuted { proposal, record } => info!(
                    event = %ev.kind(),
                    proposal_id = %proposal.id,
                    adjustments = ?record.adjustments,
                    failures = record.failures.len(),
                    "proposal event"
                ),
                CoordinationEvent::Error { component, message } => {
                    error!(component = %component, "{message}");
                }
            }
            Ok(())
        });
    }
}

// ─── Signals ─────────────────────────────────────────────────────────

async fn cancel_on_signal(shutdown: CancellationToken) {
    wait_for_signal().await;
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("received ctrl-c, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = ctrl_c.await;
            info!("received ctrl-c, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c, shutting down");
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    use agentmesh_coordinator::storage::{CONNECTIONS_KEY, load_json};
    use agentmesh_coordinator::{ConnectionConfig, ExecutionConfig};
    use agentmesh_core::types::{Connection, ConnectionStatus, Envelope, Operation, OperatorId};
    use agentmesh_poller::PollerConfig;

    fn settings(root: &Path) -> Settings {
        Settings {
            identity: OperatorId::new("0.0.100", "0.0.1"),
            governance_topics: vec![TopicId::new("0.0.100")],
            peers: Vec::new(),
            poll_interval: Duration::from_millis(50),
            poller: PollerConfig {
                cache_ttl: Duration::ZERO,
                ..PollerConfig::default()
            },
            cache_sweep: Duration::from_secs(30),
            connections: ConnectionConfig::default(),
            cleanup_interval: Duration::from_secs(300),
            execution: ExecutionConfig::default(),
            state_dir: root.join("state"),
            log_dir: root.join("log"),
            balances: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn keeps_running_while_idle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let task = tokio::spawn(run(settings(tmp.path())));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        task.abort();

        assert!(tmp.path().join("log").join("0.0.100.jsonl").exists());
        assert!(tmp.path().join("state").is_dir());
    }

    #[tokio::test]
    async fn answers_connection_request_from_file_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let s = settings(tmp.path());
        let log = FileLogTransport::open(tmp.path().join("log")).expect("log");
        let own = TopicId::new("0.0.100");
        let peer_topic = TopicId::new("0.0.200");
        log.ensure_topic(&own).expect("own");
        log.ensure_topic(&peer_topic).expect("peer");

        let request = Envelope::new(Operation::ConnectionRequest)
            .with_operator(&OperatorId::new("0.0.200", "0.0.2"))
            .to_json()
            .expect("encode");
        log.publish(&own, request).await.expect("publish");

        let task = tokio::spawn(run(s));
        let storage = FileStorage::open(tmp.path().join("state")).expect("storage");

        let mut established = Vec::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let conns: Vec<Connection> = load_json(&storage, CONNECTIONS_KEY).expect("load");
            if conns.iter().any(|c| c.status == ConnectionStatus::Established) {
                established = conns;
                break;
            }
        }
        task.abort();
        assert_eq!(established.len(), 1, "connection never established");

        let acks: Vec<Envelope> = log
            .poll(&peer_topic, 0)
            .await
            .expect("poll")
            .iter()
            .filter_map(|m| m.envelope().ok())
            .filter(|e| e.op == Operation::ConnectionCreated)
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(
            acks[0].connection_topic_id,
            established[0].connection_topic_id
        );
    }
}
