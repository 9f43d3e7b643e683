//! In-process synchronous publish/subscribe keyed by event kind.
//!
//! Constructed explicitly and shared as `Arc<EventBus>`; nothing is global,
//! and a fresh process starts with no subscriptions. `emit` runs every
//! handler for the kind, in registration order, before returning. A handler
//! that returns an error or panics is logged and does not stop the rest.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{error, warn};

use agentmesh_core::types::{Connection, ExecutionRecord, Proposal};

// ─── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionRequested,
    ConnectionEstablished,
    ConnectionClosed,
    ProposalReceived,
    ProposalExecuted,
    ProposalFailed,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        Self::ConnectionRequested,
        Self::ConnectionEstablished,
        Self::ConnectionClosed,
        Self::ProposalReceived,
        Self::ProposalExecuted,
        Self::ProposalFailed,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionRequested => "connection_requested",
            Self::ConnectionEstablished => "connection_established",
            Self::ConnectionClosed => "connection_closed",
            Self::ProposalReceived => "proposal_received",
            Self::ProposalExecuted => "proposal_executed",
            Self::ProposalFailed => "proposal_failed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the coordination layer tells the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinationEvent {
    ConnectionRequested { connection: Connection },
    ConnectionEstablished { connection: Connection },
    ConnectionClosed { connection: Connection },
    ProposalReceived { proposal: Proposal },
    ProposalExecuted { proposal: Proposal, record: ExecutionRecord },
    ProposalFailed { proposal: Proposal },
    Error { component: String, message: String },
}

impl CoordinationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionRequested { .. } => EventKind::ConnectionRequested,
            Self::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Self::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            Self::ProposalReceived { .. } => EventKind::ProposalReceived,
            Self::ProposalExecuted { .. } => EventKind::ProposalExecuted,
            Self::ProposalFailed { .. } => EventKind::ProposalFailed,
            Self::Error { .. } => EventKind::Error,
        }
    }

    pub fn error(component: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Error {
            component: component.into(),
            message: message.to_string(),
        }
    }
}

// ─── Bus ─────────────────────────────────────────────────────────────

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&CoordinationEvent) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<EventKind, Vec<Subscription>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subs = self.lock();
        let counts: HashMap<EventKind, usize> = subs.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("subscriptions", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe<F>(&self, kind: EventKind, once: bool, handler: F) -> SubscriptionId
    where
        F: Fn(&CoordinationEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(kind).or_default().push(Subscription {
            id,
            once,
            handler: Arc::new(handler),
        });
        id
    }

    /// Call `handler` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CoordinationEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(kind, false, handler)
    }

    /// Call `handler` for the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CoordinationEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(kind, true, handler)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        for list in subs.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to its subscribers. Returns how many handlers ran
    /// without error.
    ///
    /// Handlers run outside the subscription lock, so they may subscribe or
    /// emit themselves.
    pub fn emit(&self, event: CoordinationEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut subs = self.lock();
            let Some(list) = subs.get_mut(&kind) else {
                return 0;
            };
            let handlers = list.iter().map(|s| Arc::clone(&s.handler)).collect();
            list.retain(|s| !s.once);
            handlers
        };

        let mut ok = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => warn!(event = %kind, error = %e, "event handler failed"),
                Err(_) => error!(event = %kind, "event handler panicked"),
            }
        }
        ok
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn err_event(msg: &str) -> CoordinationEvent {
        CoordinationEvent::error("test", msg)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |tag: &str| -> Handler {
                let log = Arc::clone(&log);
                let tag = tag.to_owned();
                Arc::new(move |_ev: &CoordinationEvent| {
                    log.lock().expect("lock").push(tag.clone());
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        for tag in ["a", "b", "c"] {
            let h = make(tag);
            bus.on(EventKind::Error, move |e| h(e));
        }

        assert_eq!(bus.emit(err_event("x")), 3);
        assert_eq!(*log.lock().expect("lock"), vec!["a", "b", "c"]);
    }

    #[test]
    fn emit_only_reaches_matching_kind() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let h = make("closed");
        bus.on(EventKind::ConnectionClosed, move |e| h(e));

        assert_eq!(bus.emit(err_event("x")), 0);
        assert!(log.lock().expect("lock").is_empty());
    }

    #[test]
    fn once_fires_a_single_time() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let h = make("once");
        bus.once(EventKind::Error, move |e| h(e));

        bus.emit(err_event("1"));
        bus.emit(err_event("2"));
        assert_eq!(log.lock().expect("lock").len(), 1);
        assert_eq!(bus.handler_count(EventKind::Error), 0);
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_block_others() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.on(EventKind::Error, |_| Err("boom".into()));
        bus.on(EventKind::Error, |_| panic!("handler bug"));
        let h = make("survivor");
        bus.on(EventKind::Error, move |e| h(e));

        assert_eq!(bus.emit(err_event("x")), 1);
        assert_eq!(*log.lock().expect("lock"), vec!["survivor"]);
    }

    #[test]
    fn off_and_clear_remove_subscriptions() {
        let bus = EventBus::new();
        let id = bus.on(EventKind::Error, |_| Ok(()));
        bus.on(EventKind::ProposalReceived, |_| Ok(()));

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.handler_count(EventKind::Error), 0);

        bus.clear();
        assert_eq!(bus.handler_count(EventKind::ProposalReceived), 0);
    }

    #[test]
    fn handler_may_emit_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let (log, make) = recorder();
        let h = make("inner");
        bus.on(EventKind::ConnectionClosed, move |e| h(e));

        let inner_bus = Arc::clone(&bus);
        bus.on(EventKind::Error, move |_| {
            inner_bus.emit(CoordinationEvent::ConnectionClosed {
                connection: agentmesh_core::types::Connection::new(
                    1,
                    1,
                    &agentmesh_core::types::OperatorId::new("0.0.1", "0.0.2"),
                    agentmesh_core::types::ConnectionStatus::Closed,
                    chrono::Utc::now(),
                ),
            });
            Ok(())
        });

        bus.emit(err_event("x"));
        assert_eq!(*log.lock().expect("lock"), vec!["inner"]);
    }
}
