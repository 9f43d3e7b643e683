//! Connection handshake state machine and stale sweep.
//!
//! ```text
//! (none) ──request_connection──▶ requested ──connection_created──▶ established
//! (none) ──connection_request──▶ needs_confirmation ──ack published──▶ established
//! any open state ──close notice | close() | sweep──▶ closed
//! ```
//!
//! At most one open connection exists per peer inbound topic. A repeated
//! `connection_request` from a known peer re-sends the acknowledgment for
//! the existing connection instead of creating another one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use agentmesh_core::types::{
    Connection, ConnectionStatus, Envelope, LogMessage, Operation, OperatorId, TopicId,
};
use agentmesh_poller::{LogTransport, MessageBatch};

use crate::agent::Agent;
use crate::error::CoordinatorError;
use crate::event_bus::{CoordinationEvent, EventBus};
use crate::storage::{CONNECTIONS_KEY, Storage, load_json, save_json};

const COMPONENT: &str = "connection_manager";

// ─── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Requested/needs-confirmation connections older than this are closed.
    pub pending_timeout: Duration,
    /// Established connections older than this get a close notice and are
    /// closed.
    pub established_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(24 * 60 * 60),
            established_timeout: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

// ─── Manager ─────────────────────────────────────────────────────────

pub struct ConnectionManager {
    identity: OperatorId,
    transport: Arc<dyn LogTransport>,
    storage: Arc<dyn Storage>,
    bus: Arc<EventBus>,
    config: ConnectionConfig,
    connections: BTreeMap<u64, Connection>,
    next_id: u64,
}

impl ConnectionManager {
    /// Build a manager for the agent `identity`, restoring any connections
    /// persisted by a previous run.
    pub fn new(
        identity: OperatorId,
        transport: Arc<dyn LogTransport>,
        storage: Arc<dyn Storage>,
        bus: Arc<EventBus>,
        config: ConnectionConfig,
    ) -> Result<Self, CoordinatorError> {
        let saved: Vec<Connection> = load_json(storage.as_ref(), CONNECTIONS_KEY)?;
        let next_id = saved.iter().map(|c| c.id).max().map_or(1, |id| id + 1);
        let connections = saved.into_iter().map(|c| (c.id, c)).collect();
        Ok(Self {
            identity,
            transport,
            storage,
            bus,
            config,
            connections,
            next_id,
        })
    }

    pub fn identity(&self) -> &OperatorId {
        &self.identity
    }

    pub fn inbound_topic(&self) -> &TopicId {
        &self.identity.topic_id
    }

    // ── Accessors ──

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn get(&self, id: u64) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// The open connection to the peer whose inbound topic is `peer_topic`.
    pub fn find_open_by_peer(&self, peer_topic: &TopicId) -> Option<&Connection> {
        self.connections
            .values()
            .find(|c| c.status.is_open() && &c.peer_topic_id == peer_topic)
    }

    /// Dedicated topics of every established connection.
    pub fn established_topics(&self) -> BTreeSet<TopicId> {
        self.connections
            .values()
            .filter(|c| c.status == ConnectionStatus::Established)
            .filter_map(|c| c.connection_topic_id.clone())
            .collect()
    }

    pub fn is_connection_topic(&self, topic: &TopicId) -> bool {
        self.connection_on_topic(topic).is_some()
    }

    fn connection_on_topic(&self, topic: &TopicId) -> Option<&Connection> {
        self.connections
            .values()
            .find(|c| c.status.is_open() && c.connection_topic_id.as_ref() == Some(topic))
    }

    // ── Inbound ──

    /// Handle a batch from the agent's inbound topic.
    ///
    /// Connections whose acknowledgment failed to publish earlier are retried
    /// first.
    pub async fn process_inbound(&mut self, messages: &[LogMessage], now: DateTime<Utc>) {
        self.retry_unacknowledged().await;
        for msg in messages {
            self.handle_inbound(msg, now).await;
        }
    }

    async fn handle_inbound(&mut self, msg: &LogMessage, now: DateTime<Utc>) {
        let env = match msg.envelope() {
            Ok(env) => env,
            Err(e) => {
                debug!(seq = msg.sequence_number, error = %e, "skipping non-envelope message");
                return;
            }
        };
        match env.op {
            Operation::ConnectionRequest => self.on_connection_request(msg, &env, now).await,
            Operation::ConnectionCreated => self.on_connection_created(&env),
            Operation::CloseConnection => self.on_close_notice(&msg.topic_id, &env, now),
            Operation::Message | Operation::Unknown => {}
        }
    }

    async fn on_connection_request(&mut self, msg: &LogMessage, env: &Envelope, now: DateTime<Utc>) {
        let peer = match env.operator() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(seq = msg.sequence_number, error = %e, "dropping connection request");
                self.report(format!("connection request {}: {e}", msg.sequence_number));
                return;
            }
        };

        if let Some(existing) = self.find_open_by_peer(&peer.topic_id) {
            let id = existing.id;
            debug!(connection_id = id, peer = %peer, "re-acknowledging known peer");
            let crossed = match self.connections.get_mut(&id) {
                // Both sides asked at once: answer theirs.
                Some(conn) if conn.status == ConnectionStatus::Requested => {
                    conn.status = ConnectionStatus::NeedsConfirmation;
                    conn.request_sequence = msg.sequence_number;
                    true
                }
                _ => false,
            };
            if crossed {
                self.persist();
            }
            self.acknowledge(id).await;
            return;
        }

        let id = self.allocate_id();
        let conn = Connection::new(
            id,
            msg.sequence_number,
            &peer,
            ConnectionStatus::NeedsConfirmation,
            now,
        );
        info!(connection_id = id, peer = %peer, "connection requested by peer");
        self.connections.insert(id, conn.clone());
        self.persist();
        self.bus
            .emit(CoordinationEvent::ConnectionRequested { connection: conn });
        self.acknowledge(id).await;
    }

    /// Publish `connection_created` for connection `id` on the peer's inbound
    /// topic, creating the dedicated connection topic first if none is
    /// recorded. On failure the connection keeps its current state.
    async fn acknowledge(&mut self, id: u64) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        if !conn.status.is_open() {
            return false;
        }
        let peer_topic = conn.peer_topic_id.clone();
        let request_sequence = conn.request_sequence;

        let topic = match conn.connection_topic_id.clone() {
            Some(topic) => topic,
            None => {
                let memo = format!("connection {}:{}", self.identity.account_id, peer_topic);
                match self.transport.create_topic(&memo).await {
                    Ok(topic) => {
                        if let Some(conn) = self.connections.get_mut(&id) {
                            conn.connection_topic_id = Some(topic.clone());
                        }
                        self.persist();
                        topic
                    }
                    Err(e) => {
                        warn!(connection_id = id, error = %e, "failed to create connection topic");
                        self.report(format!("create topic for connection {id}: {e}"));
                        return false;
                    }
                }
            }
        };

        let ack = Envelope::new(Operation::ConnectionCreated)
            .with_operator(&self.identity)
            .with_connection(topic.clone(), request_sequence);
        let sent = match ack.to_json() {
            Ok(payload) => self
                .transport
                .publish(&peer_topic, payload)
                .await
                .map_err(CoordinatorError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(connection_id = id, peer_topic = %peer_topic, error = %e, "acknowledgment not delivered");
            self.report(format!("acknowledge connection {id}: {e}"));
            return false;
        }

        debug!(connection_id = id, topic = %topic, "acknowledgment sent");
        self.mark_established(id);
        true
    }

    fn mark_established(&mut self, id: u64) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.status == ConnectionStatus::Established {
            return;
        }
        conn.status = ConnectionStatus::Established;
        let snapshot = conn.clone();
        info!(connection_id = id, peer = %snapshot.peer_topic_id, "connection established");
        self.persist();
        self.bus.emit(CoordinationEvent::ConnectionEstablished {
            connection: snapshot,
        });
    }

    async fn retry_unacknowledged(&mut self) {
        let waiting: Vec<u64> = self
            .connections
            .values()
            .filter(|c| c.status == ConnectionStatus::NeedsConfirmation)
            .map(|c| c.id)
            .collect();
        for id in waiting {
            debug!(connection_id = id, "retrying acknowledgment");
            self.acknowledge(id).await;
        }
    }

    /// The peer accepted a request we sent.
    fn on_connection_created(&mut self, env: &Envelope) {
        let peer = match env.operator() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "dropping connection_created");
                self.report(format!("connection_created: {e}"));
                return;
            }
        };
        let Some(topic) = env.connection_topic_id.clone() else {
            warn!(peer = %peer, "connection_created without connection topic");
            self.report(format!("connection_created from {peer}: missing connection_topic_id"));
            return;
        };

        let requested = |c: &&Connection| c.status == ConnectionStatus::Requested;
        let matched = self
            .connections
            .values()
            .filter(requested)
            .find(|c| Some(c.request_sequence) == env.connection_id && c.peer_topic_id == peer.topic_id)
            .or_else(|| {
                self.connections
                    .values()
                    .filter(requested)
                    .find(|c| c.peer_topic_id == peer.topic_id)
            })
            .map(|c| c.id);

        let Some(id) = matched else {
            debug!(peer = %peer, "ignoring unsolicited connection_created");
            return;
        };
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.connection_topic_id = Some(topic);
            conn.peer_account_id = peer.account_id;
        }
        self.mark_established(id);
    }

    /// A peer closed a connection, either on its dedicated topic or on our
    /// inbound topic.
    fn on_close_notice(&mut self, topic: &TopicId, env: &Envelope, now: DateTime<Utc>) {
        let by_topic = self
            .connection_on_topic(topic)
            .or_else(|| {
                env.connection_topic_id
                    .as_ref()
                    .and_then(|t| self.connection_on_topic(t))
            })
            .map(|c| c.id);
        let by_peer = || {
            env.operator()
                .ok()
                .and_then(|peer| self.find_open_by_peer(&peer.topic_id).map(|c| c.id))
        };

        match by_topic.or_else(by_peer) {
            Some(id) => {
                let reason = env.memo.clone().unwrap_or_else(|| "closed by peer".to_owned());
                self.close_local(id, reason, now);
            }
            None => debug!(topic = %topic, "close notice for unknown connection"),
        }
    }

    /// Handle a batch from a dedicated connection topic. Only close notices
    /// matter here; application traffic belongs to other agents.
    pub fn process_connection_messages(&mut self, messages: &[LogMessage], now: DateTime<Utc>) {
        for msg in messages {
            match msg.envelope() {
                Ok(env) if env.op == Operation::CloseConnection => {
                    self.on_close_notice(&msg.topic_id, &env, now);
                }
                _ => {}
            }
        }
    }

    // ── Outbound ──

    /// Ask the agent listening on `peer_topic` for a connection.
    ///
    /// Returns the existing connection's id if one is already open.
    pub async fn request_connection(
        &mut self,
        peer_topic: TopicId,
        peer_account: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<u64, CoordinatorError> {
        if let Some(existing) = self.find_open_by_peer(&peer_topic) {
            return Ok(existing.id);
        }
        let peer = OperatorId::new(peer_topic, peer_account);
        let payload = Envelope::new(Operation::ConnectionRequest)
            .with_operator(&self.identity)
            .to_json()?;
        let sequence = self.transport.publish(&peer.topic_id, payload).await?;

        let id = self.allocate_id();
        let conn = Connection::new(id, sequence, &peer, ConnectionStatus::Requested, now);
        info!(connection_id = id, peer = %peer, "connection request sent");
        self.connections.insert(id, conn.clone());
        self.persist();
        self.bus
            .emit(CoordinationEvent::ConnectionRequested { connection: conn });
        Ok(id)
    }

    /// Close connection `id`, telling the peer if the connection was
    /// established. Returns `false` if it was unknown or already closed.
    pub async fn close(&mut self, id: u64, reason: &str, now: DateTime<Utc>) -> bool {
        match self.connections.get(&id) {
            Some(conn) if conn.status.is_open() => {}
            _ => return false,
        }
        self.send_close_notice(id, reason).await;
        self.close_local(id, reason.to_owned(), now);
        true
    }

    async fn send_close_notice(&self, id: u64, reason: &str) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let Some(topic) = conn.connection_topic_id.clone() else {
            return;
        };
        if conn.status != ConnectionStatus::Established {
            return;
        }
        let notice = Envelope::new(Operation::CloseConnection)
            .with_operator(&self.identity)
            .with_connection(topic.clone(), conn.request_sequence)
            .with_memo(reason);
        let sent = match notice.to_json() {
            Ok(payload) => self
                .transport
                .publish(&topic, payload)
                .await
                .map_err(CoordinatorError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(connection_id = id, topic = %topic, error = %e, "close notice not delivered");
            self.report(format!("close notice for connection {id}: {e}"));
        }
    }

    fn close_local(&mut self, id: u64, reason: String, now: DateTime<Utc>) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.status.is_open() {
            return;
        }
        conn.close(reason, now);
        let snapshot = conn.clone();
        info!(
            connection_id = id,
            peer = %snapshot.peer_topic_id,
            reason = snapshot.close_reason.as_deref().unwrap_or_default(),
            "connection closed"
        );
        self.persist();
        self.bus.emit(CoordinationEvent::ConnectionClosed {
            connection: snapshot,
        });
    }

    // ── Sweep ──

    /// Close connections that outlived their timeout. Returns how many were
    /// closed.
    ///
    /// Pending connections are closed silently. Established ones get a close
    /// notice on their topic first; once closed they are never swept again.
    pub async fn sweep_stale(&mut self, now: DateTime<Utc>) -> usize {
        let pending_limit = to_delta(self.config.pending_timeout);
        let established_limit = to_delta(self.config.established_timeout);

        let stale: Vec<(u64, bool)> = self
            .connections
            .values()
            .filter_map(|c| {
                let age = now - c.created_at;
                match c.status {
                    ConnectionStatus::Requested | ConnectionStatus::NeedsConfirmation
                        if age > pending_limit =>
                    {
                        Some((c.id, false))
                    }
                    ConnectionStatus::Established if age > established_limit => Some((c.id, true)),
                    _ => None,
                }
            })
            .collect();

        for &(id, notify) in &stale {
            if notify {
                self.send_close_notice(id, "stale").await;
            }
            self.close_local(id, "stale".to_owned(), now);
        }
        if !stale.is_empty() {
            info!(closed = stale.len(), "stale connections swept");
        }
        stale.len()
    }

    // ── Internals ──

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn persist(&self) {
        let all: Vec<&Connection> = self.connections.values().collect();
        if let Err(e) = save_json(self.storage.as_ref(), CONNECTIONS_KEY, &all) {
            error!(error = %e, "failed to persist connections");
            self.report(format!("persist connections: {e}"));
        }
    }

    fn report(&self, message: String) {
        self.bus.emit(CoordinationEvent::error(COMPONENT, message));
    }
}

#[async_trait]
impl Agent for ConnectionManager {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn watched_topics(&self) -> BTreeSet<TopicId> {
        let mut topics: BTreeSet<TopicId> = self
            .connections
            .values()
            .filter(|c| c.status.is_open())
            .filter_map(|c| c.connection_topic_id.clone())
            .collect();
        topics.insert(self.identity.topic_id.clone());
        topics
    }

    async fn start(&mut self) -> Result<(), CoordinatorError> {
        let open = self.connections.values().filter(|c| c.status.is_open()).count();
        info!(identity = %self.identity, open, "connection manager started");
        Ok(())
    }

    async fn handle_batch(&mut self, batch: &MessageBatch, now: DateTime<Utc>) {
        if batch.topic == self.identity.topic_id {
            self.process_inbound(&batch.messages, now).await;
        } else if self.is_connection_topic(&batch.topic) {
            self.process_connection_messages(&batch.messages, now);
        }
    }

    async fn maintain(&mut self, now: DateTime<Utc>) {
        self.retry_unacknowledged().await;
        self.sweep_stale(now).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
