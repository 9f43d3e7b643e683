//! Rebalance governance: propose → approve → execute.
//!
//! Proposals arrive as `RebalanceProposal` bodies and wait in the pending
//! set until a `RebalanceApproved` for the same id shows up. Execution reads
//! balances, mints or burns toward the target weights one asset at a time,
//! and settles the proposal as executed (even if some assets failed) or
//! failed (if balances could not be read or the adjustment math overflows).
//! A proposal id is in exactly one of the pending or settled sets.
//!
//! Approvals queue up and run one at a time. Each ledger call is bounded by
//! [`ExecutionConfig::ledger_timeout`]. After shutdown begins, queued
//! approvals stay queued and their proposals stay pending; an execution
//! already underway makes no further ledger adjustments and records the
//! remaining assets as [`SKIPPED_ON_SHUTDOWN`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentmesh_core::adjust::{LedgerAction, compute_adjustments, plan_actions};
use agentmesh_core::types::{
    Envelope, ExecutionRecord, GovernanceMessage, LogMessage, Operation, OperatorId, Proposal,
    ProposalStatus, TopicId, Weights,
};
use agentmesh_core::ValidationError;
use agentmesh_poller::{LogTransport, MessageBatch};

use crate::agent::Agent;
use crate::error::{CoordinatorError, LedgerError};
use crate::event_bus::{CoordinationEvent, EventBus, EventKind, SubscriptionId};
use crate::ledger::LedgerAdapter;
use crate::storage::{
    EXECUTED_PROPOSALS_KEY, PENDING_PROPOSALS_KEY, SETTLED_PROPOSALS_KEY, Storage, load_json,
    save_json,
};

const COMPONENT: &str = "proposal_coordinator";

/// Failure reason recorded for adjustments not attempted once shutdown began.
pub const SKIPPED_ON_SHUTDOWN: &str = "skipped: shutdown";

// ─── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Upper bound on any single ledger call (default 30s).
    pub ledger_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            ledger_timeout: Duration::from_secs(30),
        }
    }
}

async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(LedgerError::Timeout(limit)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Approval {
    proposal_id: String,
    /// Where the approval arrived; the execution summary goes back there.
    reply_topic: Option<TopicId>,
}

type TopicSet = Arc<Mutex<BTreeSet<TopicId>>>;

fn lock(topics: &TopicSet) -> MutexGuard<'_, BTreeSet<TopicId>> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Coordinator ─────────────────────────────────────────────────────

pub struct ProposalCoordinator {
    identity: OperatorId,
    transport: Arc<dyn LogTransport>,
    storage: Arc<dyn Storage>,
    bus: Arc<EventBus>,
    ledger: Arc<dyn LedgerAdapter>,
    config: ExecutionConfig,
    governance_topics: BTreeSet<TopicId>,
    /// Dedicated topics of established connections, kept current from bus
    /// events.
    connection_topics: TopicSet,
    subscriptions: Vec<SubscriptionId>,
    pending: BTreeMap<String, Proposal>,
    settled: BTreeMap<String, Proposal>,
    records: Vec<ExecutionRecord>,
    approvals: VecDeque<Approval>,
    shutdown: CancellationToken,
}

impl ProposalCoordinator {
    /// Build a coordinator, restoring persisted proposals and execution
    /// records, and subscribe to connection lifecycle events on `bus`.
    pub fn new(
        identity: OperatorId,
        transport: Arc<dyn LogTransport>,
        storage: Arc<dyn Storage>,
        bus: Arc<EventBus>,
        ledger: Arc<dyn LedgerAdapter>,
        config: ExecutionConfig,
    ) -> Result<Self, CoordinatorError> {
        let pending: Vec<Proposal> = load_json(storage.as_ref(), PENDING_PROPOSALS_KEY)?;
        let settled: Vec<Proposal> = load_json(storage.as_ref(), SETTLED_PROPOSALS_KEY)?;
        let records: Vec<ExecutionRecord> = load_json(storage.as_ref(), EXECUTED_PROPOSALS_KEY)?;

        let connection_topics: TopicSet = Arc::default();
        let subscriptions = vec![
            bus.on(EventKind::ConnectionEstablished, {
                let topics = Arc::clone(&connection_topics);
                move |ev| {
                    if let CoordinationEvent::ConnectionEstablished { connection } = ev {
                        if let Some(topic) = &connection.connection_topic_id {
                            lock(&topics).insert(topic.clone());
                        }
                    }
                    Ok(())
                }
            }),
            bus.on(EventKind::ConnectionClosed, {
                let topics = Arc::clone(&connection_topics);
                move |ev| {
                    if let CoordinationEvent::ConnectionClosed { connection } = ev {
                        if let Some(topic) = &connection.connection_topic_id {
                            lock(&topics).remove(topic);
                        }
                    }
                    Ok(())
                }
            }),
        ];

        Ok(Self {
            identity,
            transport,
            storage,
            bus,
            ledger,
            config,
            governance_topics: BTreeSet::new(),
            connection_topics,
            subscriptions,
            pending: pending.into_iter().map(|p| (p.id.clone(), p)).collect(),
            settled: settled.into_iter().map(|p| (p.id.clone(), p)).collect(),
            records,
            approvals: VecDeque::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Also consume proposals and approvals from these topics.
    pub fn with_governance_topics(mut self, topics: impl IntoIterator<Item = TopicId>) -> Self {
        self.governance_topics.extend(topics);
        self
    }

    /// Share a shutdown token with the run loop.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Seed connection topics known before this coordinator subscribed
    /// (e.g. restored from storage).
    pub fn track_connection_topics(&self, topics: impl IntoIterator<Item = TopicId>) {
        lock(&self.connection_topics).extend(topics);
    }

    // ── Accessors ──

    pub fn pending(&self) -> impl Iterator<Item = &Proposal> {
        self.pending.values()
    }

    pub fn settled(&self) -> impl Iterator<Item = &Proposal> {
        self.settled.values()
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn proposal(&self, id: &str) -> Option<&Proposal> {
        self.pending.get(id).or_else(|| self.settled.get(id))
    }

    pub fn queued_approvals(&self) -> usize {
        self.approvals.len()
    }

    // ── Ingestion ──

    /// Decode one log message and route governance bodies. Anything else is
    /// ignored.
    pub async fn handle_message(&mut self, msg: &LogMessage, now: DateTime<Utc>) {
        let Ok(env) = msg.envelope() else {
            return;
        };
        if env.op != Operation::Message {
            return;
        }
        let body = match env.governance_body() {
            Ok(body) => body,
            Err(e) if looks_like_governance(&env) => {
                warn!(topic = %msg.topic_id, seq = msg.sequence_number, error = %e, "dropping governance message");
                self.report(format!("message {}#{}: {e}", msg.topic_id, msg.sequence_number));
                return;
            }
            Err(_) => {
                debug!(topic = %msg.topic_id, seq = msg.sequence_number, "ignoring application message");
                return;
            }
        };

        match body {
            GovernanceMessage::RebalanceProposal { id, new_weights } => {
                if let Err(e) = self.on_proposal(id, new_weights, now) {
                    warn!(topic = %msg.topic_id, seq = msg.sequence_number, error = %e, "dropping proposal");
                    self.report(format!("proposal {}#{}: {e}", msg.topic_id, msg.sequence_number));
                }
            }
            GovernanceMessage::RebalanceApproved { proposal_id } => {
                self.on_approval(&proposal_id, Some(msg.topic_id.clone()), now)
                    .await;
            }
            GovernanceMessage::RebalanceExecuted(record) => {
                debug!(proposal_id = %record.proposal_id, "execution summary observed");
            }
        }
    }

    /// Record a new pending proposal. Returns `Ok(false)` if the id was seen
    /// before, in which case nothing changes.
    pub fn on_proposal(
        &mut self,
        id: String,
        new_weights: Weights,
        now: DateTime<Utc>,
    ) -> Result<bool, ValidationError> {
        if self.pending.contains_key(&id) || self.settled.contains_key(&id) {
            debug!(proposal_id = %id, "duplicate proposal ignored");
            return Ok(false);
        }
        let proposal = Proposal::pending(id, new_weights, now)?;
        info!(proposal_id = %proposal.id, assets = proposal.new_weights.len(), "proposal received");
        self.pending.insert(proposal.id.clone(), proposal.clone());
        self.persist();
        self.bus.emit(CoordinationEvent::ProposalReceived { proposal });
        Ok(true)
    }

    /// Queue an approval and run every queued approval in order. Returns
    /// `false` if the approval was dropped.
    pub async fn on_approval(
        &mut self,
        proposal_id: &str,
        reply_topic: Option<TopicId>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.pending.contains_key(proposal_id) {
            warn!(proposal_id, "approval for unknown or settled proposal");
            return false;
        }
        if self.approvals.iter().any(|a| a.proposal_id == proposal_id) {
            debug!(proposal_id, "approval already queued");
            return false;
        }
        self.approvals.push_back(Approval {
            proposal_id: proposal_id.to_owned(),
            reply_topic,
        });
        self.drain_approvals(now).await;
        true
    }

    async fn drain_approvals(&mut self, now: DateTime<Utc>) {
        while !self.approvals.is_empty() {
            if self.shutdown.is_cancelled() {
                info!(queued = self.approvals.len(), "shutting down, approvals left pending");
                return;
            }
            if let Some(approval) = self.approvals.pop_front() {
                self.execute(approval, now).await;
            }
        }
    }

    // ── Execution ──

    async fn execute(&mut self, approval: Approval, now: DateTime<Utc>) {
        let Some(proposal) = self.pending.get(&approval.proposal_id).cloned() else {
            warn!(proposal_id = %approval.proposal_id, "proposal settled before execution");
            return;
        };
        let limit = self.config.ledger_timeout;
        info!(proposal_id = %proposal.id, "executing proposal");

        let pre_balances = match bounded(limit, self.ledger.get_balances()).await {
            Ok(balances) => balances,
            Err(e) => {
                self.fail(proposal, e.to_string());
                return;
            }
        };

        let adjustments = match compute_adjustments(&pre_balances, &proposal.new_weights) {
            Ok(adjustments) => adjustments,
            Err(e) => {
                self.fail(proposal, e.to_string());
                return;
            }
        };
        let mut projected = pre_balances.clone();
        let mut failures = BTreeMap::new();
        for (asset, action) in plan_actions(&adjustments) {
            if self.shutdown.is_cancelled() {
                info!(proposal_id = %proposal.id, %asset, "shutting down, adjustment skipped");
                failures.insert(asset, SKIPPED_ON_SHUTDOWN.to_owned());
                continue;
            }
            let result = match action {
                LedgerAction::Mint(amount) => bounded(limit, self.ledger.mint(&asset, amount)).await,
                LedgerAction::Burn(amount) => bounded(limit, self.ledger.burn(&asset, amount)).await,
            };
            match result {
                Ok(()) => {
                    let held = projected.entry(asset.clone()).or_default();
                    let next = match action {
                        LedgerAction::Mint(amount) => held.checked_add(amount),
                        LedgerAction::Burn(amount) => held.checked_sub(amount),
                    };
                    match next {
                        Some(value) => *held = value,
                        None => warn!(proposal_id = %proposal.id, %asset, "projected balance out of range, left unchanged"),
                    }
                    debug!(proposal_id = %proposal.id, %asset, ?action, "ledger adjusted");
                }
                Err(e) => {
                    warn!(proposal_id = %proposal.id, %asset, ?action, error = %e, "ledger adjustment failed");
                    self.report(format!("proposal {} {asset}: {e}", proposal.id));
                    failures.insert(asset, e.to_string());
                }
            }
        }

        let post_balances = match bounded(limit, self.ledger.get_balances()).await {
            Ok(balances) => balances,
            Err(e) => {
                warn!(proposal_id = %proposal.id, error = %e, "post-execution balance read failed, recording projection");
                projected
            }
        };

        let record = ExecutionRecord {
            proposal_id: proposal.id.clone(),
            pre_balances,
            post_balances,
            adjustments,
            executed_at: now,
            failures,
        };
        let mut executed = proposal;
        executed.status = ProposalStatus::Executed;
        self.pending.remove(&executed.id);
        self.settled.insert(executed.id.clone(), executed.clone());
        self.records.push(record.clone());
        self.persist();
        info!(
            proposal_id = %executed.id,
            failed_assets = record.failures.len(),
            "proposal executed"
        );

        if let Some(topic) = &approval.reply_topic {
            self.publish_summary(topic, &record).await;
        }
        self.bus.emit(CoordinationEvent::ProposalExecuted {
            proposal: executed,
            record,
        });
    }

    fn fail(&mut self, mut proposal: Proposal, reason: String) {
        warn!(proposal_id = %proposal.id, error = %reason, "proposal failed");
        proposal.status = ProposalStatus::Failed;
        proposal.error = Some(reason);
        self.pending.remove(&proposal.id);
        self.settled.insert(proposal.id.clone(), proposal.clone());
        self.persist();
        self.bus.emit(CoordinationEvent::ProposalFailed { proposal });
    }

    async fn publish_summary(&self, topic: &TopicId, record: &ExecutionRecord) {
        let body = GovernanceMessage::RebalanceExecuted(record.clone());
        let sent = match Envelope::governance(&self.identity, &body).and_then(|env| env.to_json()) {
            Ok(payload) => self
                .transport
                .publish(topic, payload)
                .await
                .map_err(CoordinatorError::from),
            Err(e) => Err(e.into()),
        };
        match sent {
            Ok(seq) => debug!(proposal_id = %record.proposal_id, %topic, seq, "execution summary published"),
            Err(e) => {
                warn!(proposal_id = %record.proposal_id, %topic, error = %e, "execution summary not published");
                self.report(format!("summary for {}: {e}", record.proposal_id));
            }
        }
    }

    // ── Internals ──

    fn persist(&self) {
        let pending: Vec<&Proposal> = self.pending.values().collect();
        let settled: Vec<&Proposal> = self.settled.values().collect();
        let result = save_json(self.storage.as_ref(), PENDING_PROPOSALS_KEY, &pending)
            .and_then(|()| save_json(self.storage.as_ref(), SETTLED_PROPOSALS_KEY, &settled))
            .and_then(|()| save_json(self.storage.as_ref(), EXECUTED_PROPOSALS_KEY, &self.records));
        if let Err(e) = result {
            error!(error = %e, "failed to persist proposals");
            self.report(format!("persist proposals: {e}"));
        }
    }

    fn report(&self, message: String) {
        self.bus.emit(CoordinationEvent::error(COMPONENT, message));
    }
}

/// Whether `data` is a JSON object with a `type` tag, i.e. meant as a
/// governance body rather than free-form application traffic.
fn looks_like_governance(env: &Envelope) -> bool {
    env.data
        .as_deref()
        .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
        .is_some_and(|v| v.get("type").is_some())
}

impl Drop for ProposalCoordinator {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.bus.off(id);
        }
    }
}

#[async_trait]
impl Agent for ProposalCoordinator {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn watched_topics(&self) -> BTreeSet<TopicId> {
        let mut topics = self.governance_topics.clone();
        topics.extend(lock(&self.connection_topics).iter().cloned());
        topics
    }

    async fn start(&mut self) -> Result<(), CoordinatorError> {
        info!(
            pending = self.pending.len(),
            settled = self.settled.len(),
            "proposal coordinator started"
        );
        Ok(())
    }

    async fn handle_batch(&mut self, batch: &MessageBatch, now: DateTime<Utc>) {
        for msg in &batch.messages {
            self.handle_message(msg, now).await;
        }
    }

    async fn maintain(&mut self, now: DateTime<Utc>) {
        self.drain_approvals(now).await;
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();
        if !self.approvals.is_empty() {
            info!(queued = self.approvals.len(), "approvals not executed before shutdown");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
