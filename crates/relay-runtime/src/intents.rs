//! Two-phase intent registry.
//!
//! An intent (an approval, typically) is registered first and only then
//! reported to the caller as pending, so a decision that races the
//! acknowledgement always finds its entry. Registration may short-circuit
//! with a decision when a synchronous [`DecisionPolicy`] resolves it.
//!
//! Decisions are `Option<String>`: `None` is an explicit "no" or empty
//! decision. A registration carries `Option<Option<String>>` so "no decision
//! yet" and "decided, and the decision is null" stay distinct on the wire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use relay_core::clock;
use relay_core::ids::IntentId;
use relay_settings::ApprovalSettings;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::RuntimeError;
use crate::events::{EventEmitter, GatewayEvent, names};

/// Decides an intent at registration time. `None` means "ask a human".
pub trait DecisionPolicy: Send + Sync {
    /// Immediate decision, if any.
    fn decide(&self, request: &IntentRequest) -> Option<Option<String>>;
}

impl<F> DecisionPolicy for F
where
    F: Fn(&IntentRequest) -> Option<Option<String>> + Send + Sync,
{
    fn decide(&self, request: &IntentRequest) -> Option<Option<String>> {
        self(request)
    }
}

/// What is being asked for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest {
    /// Intent kind, e.g. `"exec"`.
    #[serde(default)]
    pub kind: String,
    /// Opaque description shown to the decider.
    #[serde(default)]
    pub payload: Value,
    /// Session the intent belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Lifetime override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Result of the registration phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRegistration {
    /// Assigned ID.
    pub id: IntentId,
    /// Expiry, Unix epoch milliseconds.
    pub expires_at_ms: u64,
    /// Present only when the intent was decided during registration.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_absent"
    )]
    pub final_decision: Option<Option<String>>,
}

impl IntentRegistration {
    /// Whether the caller still has to wait.
    pub fn is_pending(&self) -> bool {
        self.final_decision.is_none()
    }
}

/// A field that is present (even as `null`) deserializes to `Some`.
fn present_or_absent<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Read-only view of an entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSnapshot {
    /// Intent ID.
    pub id: IntentId,
    /// Original request.
    pub request: IntentRequest,
    /// Expiry, Unix epoch milliseconds.
    pub expires_at_ms: u64,
    /// Whether a decision has been recorded.
    pub resolved: bool,
    /// The decision, if resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Option<String>>,
}

struct Entry {
    request: IntentRequest,
    expires_at: Instant,
    expires_at_ms: u64,
    /// `None` while pending.
    decision: watch::Sender<Option<Option<String>>>,
}

/// Registry of pending and recently decided intents.
pub struct IntentRegistry {
    default_timeout: Duration,
    policy: Option<Arc<dyn DecisionPolicy>>,
    events: Option<Arc<EventEmitter>>,
    entries: Mutex<HashMap<IntentId, Entry>>,
}

impl IntentRegistry {
    /// Registry with a default intent lifetime.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            policy: None,
            events: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registry configured from settings.
    pub fn from_settings(settings: &ApprovalSettings) -> Self {
        Self::new(Duration::from_millis(settings.default_timeout_ms))
    }

    /// Consult `policy` on every registration.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn DecisionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Emit `approval.requested` and `approval.resolved`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventEmitter>) -> Self {
        self.events = Some(events);
        self
    }

    /// Phase one: store the intent and return its ID.
    ///
    /// The entry exists before this returns, so a decision sent by anyone
    /// who learns the ID always has something to attach to.
    pub fn register(&self, request: IntentRequest) -> IntentRegistration {
        let timeout = request
            .timeout_ms
            .map_or(self.default_timeout, Duration::from_millis);
        let id = IntentId::new();
        let expires_at = Instant::now() + timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let expires_at_ms = clock::epoch_ms().saturating_add(timeout_ms);
        let final_decision = self.policy.as_ref().and_then(|p| p.decide(&request));
        let (decision, _) = watch::channel(final_decision.clone());

        {
            let mut entries = self.entries.lock();
            Self::sweep_locked(&mut entries, Instant::now());
            let _ = entries.insert(
                id.clone(),
                Entry {
                    request: request.clone(),
                    expires_at,
                    expires_at_ms,
                    decision,
                },
            );
        }
        counter!("intents_registered_total").increment(1);

        match &final_decision {
            Some(d) => debug!(intent_id = %id, decision = ?d, "intent decided by policy"),
            None => {
                debug!(intent_id = %id, kind = %request.kind, "intent registered");
                self.emit(
                    names::APPROVAL_REQUESTED,
                    json!({
                        "id": id,
                        "kind": request.kind,
                        "payload": request.payload,
                        "sessionKey": request.session_key,
                        "expiresAtMs": expires_at_ms,
                    }),
                );
            }
        }

        IntentRegistration {
            id,
            expires_at_ms,
            final_decision,
        }
    }

    /// Record a decision. `false` when the intent is unknown, expired, or
    /// already decided.
    pub fn resolve(&self, id: &str, decision: Option<String>) -> bool {
        let now = Instant::now();
        {
            let entries = self.entries.lock();
            let Some(entry) = entries.get(id) else {
                return false;
            };
            if entry.expires_at <= now || entry.decision.borrow().is_some() {
                return false;
            }
            let _ = entry.decision.send_replace(Some(decision.clone()));
        }
        counter!("intents_resolved_total").increment(1);
        info!(intent_id = id, decision = ?decision, "intent resolved");
        self.emit(
            names::APPROVAL_RESOLVED,
            json!({ "id": id, "decision": decision }),
        );
        true
    }

    /// Phase two: wait for the decision.
    ///
    /// Unknown and expired intents yield `Ok(None)`, the same as an explicit
    /// null decision. Only an entry torn down before its deadline is an error.
    pub async fn wait_for_decision(&self, id: &str) -> Result<Option<String>, RuntimeError> {
        let (mut rx, deadline) = {
            let entries = self.entries.lock();
            match entries.get(id) {
                Some(entry) => (entry.decision.subscribe(), entry.expires_at),
                None => return Ok(None),
            }
        };

        loop {
            if let Some(decision) = rx.borrow_and_update().clone() {
                return Ok(decision);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) if Instant::now() < deadline => {
                    return Err(RuntimeError::ChannelClosed(format!("intent {id}")));
                }
                Ok(Err(_)) | Err(_) => {
                    counter!("intents_expired_total").increment(1);
                    debug!(intent_id = id, "intent expired without decision");
                    return Ok(None);
                }
            }
        }
    }

    /// Snapshot of an entry.
    pub fn get(&self, id: &str) -> Option<IntentSnapshot> {
        let entries = self.entries.lock();
        entries.get(id).map(|entry| {
            let decision = entry.decision.borrow().clone();
            IntentSnapshot {
                id: IntentId::from(id),
                request: entry.request.clone(),
                expires_at_ms: entry.expires_at_ms,
                resolved: decision.is_some(),
                decision,
            }
        })
    }

    /// Entries still waiting for a decision.
    pub fn pending_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now && e.decision.borrow().is_none())
            .count()
    }

    /// Drop expired entries. Waiters on them observe "no decision".
    pub fn sweep_expired(&self) -> usize {
        Self::sweep_locked(&mut self.entries.lock(), Instant::now())
    }

    fn sweep_locked(entries: &mut HashMap<IntentId, Entry>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    fn emit(&self, name: &str, payload: Value) {
        if let Some(events) = &self.events {
            let _ = events.emit(GatewayEvent::global(name, payload));
        }
    }
}
