//! Broadcast-based emitter for gateway events.
//!
//! Registries emit [`GatewayEvent`]s here; the server's event bridge fans
//! them out to WebSocket connections, which stamp each with a `seq`.

use std::sync::atomic::{AtomicU64, Ordering};

use relay_core::ids::SessionId;
use serde_json::Value;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Event names emitted by the runtime.
pub mod names {
    /// A session was created.
    pub const SESSION_CREATED: &str = "session.created";
    /// A session was reaped, evicted, or reset.
    pub const SESSION_REMOVED: &str = "session.removed";
    /// A run began executing.
    pub const RUN_STARTED: &str = "run.started";
    /// A run finished, successfully or not.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run was cancelled.
    pub const RUN_ABORTED: &str = "run.aborted";
    /// A follow-up was queued behind the active run.
    pub const RUN_QUEUED: &str = "run.queued";
    /// A subagent tree was stopped.
    pub const SUBAGENT_STOPPED: &str = "subagent.stopped";
    /// An approval is waiting for a decision.
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    /// An approval received its decision.
    pub const APPROVAL_RESOLVED: &str = "approval.resolved";
}

/// An event before it is sequenced for a particular connection.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayEvent {
    /// Event name.
    pub event: String,
    /// Session the event concerns. `None` goes to every connection.
    pub session_id: Option<SessionId>,
    /// Event payload.
    pub payload: Value,
}

impl GatewayEvent {
    /// Event for every connection.
    pub fn global(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_owned(),
            session_id: None,
            payload,
        }
    }

    /// Event scoped to one session.
    pub fn for_session(session_id: &SessionId, event: &str, payload: Value) -> Self {
        Self {
            event: event.to_owned(),
            session_id: Some(session_id.clone()),
            payload,
        }
    }
}

/// Broadcast emitter. `emit` never blocks; lagging receivers lose events.
pub struct EventEmitter {
    tx: broadcast::Sender<GatewayEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    /// Emitter with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Emitter with a custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Emit to all subscribers. Returns how many received it.
    pub fn emit(&self, event: GatewayEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
