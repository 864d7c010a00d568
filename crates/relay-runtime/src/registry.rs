//! In-memory session registry.
//!
//! The registry is the only owner of a session's active-run state. All
//! mutation goes through one `parking_lot::Mutex`, so creation, eviction and
//! run bookkeeping each observe a consistent snapshot. Each record also has
//! its own small lock for field reads; the registry lock is always taken
//! first when both are needed.
//!
//! Records are handed out as `Arc<SessionRecord>`. Refreshing an existing
//! session mutates the record in place and returns the same `Arc`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::clock::{self, Clock};
use relay_core::ids::{RunId, SessionId};
use relay_settings::{RegistrySettings, RunSettings};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::RuntimeError;
use crate::events::{EventEmitter, GatewayEvent, names};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity and idle policy.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Soft cap on live sessions.
    pub max_sessions: usize,
    /// Idle sessions untouched for longer than this are reaped.
    pub idle_ttl: Duration,
    /// Dedupe keys remembered per session.
    pub processed_events_max: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&RegistrySettings::default(), &RunSettings::default())
    }
}

impl RegistryConfig {
    /// Build from the settings tree.
    pub fn from_settings(registry: &RegistrySettings, runs: &RunSettings) -> Self {
        Self {
            max_sessions: registry.max_sessions,
            idle_ttl: Duration::from_millis(registry.idle_ttl_ms),
            processed_events_max: runs.processed_events_max,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Arguments to [`SessionRegistry::create_session`].
#[derive(Clone, Debug, Default)]
pub struct CreateSession {
    /// Logical identity, e.g. `agent:main:channel:123`.
    pub session_key: String,
    /// Working directory.
    pub cwd: String,
    /// Reuse or pin this ID. A fresh one is generated when absent.
    pub session_id: Option<SessionId>,
}

/// Result of [`SessionRegistry::create_session`].
#[derive(Debug)]
pub struct CreatedSession {
    /// The live record.
    pub record: Arc<SessionRecord>,
    /// `true` when an existing record was rebound instead of created.
    pub refreshed: bool,
    /// Sessions removed by idle reaping or capacity eviction to make room.
    pub evicted: Vec<SessionId>,
}

struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
}

/// Bounded FIFO set of dedupe keys.
struct ProcessedEvents {
    order: VecDeque<String>,
    seen: HashSet<String>,
    max: usize,
}

impl ProcessedEvents {
    fn new(max: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            max,
        }
    }

    /// `true` if the key was not seen before.
    fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        let _ = self.seen.insert(key.to_owned());
        self.order.push_back(key.to_owned());
        while self.order.len() > self.max.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                let _ = self.seen.remove(&oldest);
            }
        }
        true
    }

    fn remove(&mut self, key: &str) -> bool {
        if !self.seen.remove(key) {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }
}

struct SessionState {
    session_key: String,
    cwd: String,
    last_touched_at: Instant,
    active_run: Option<ActiveRun>,
    processed: ProcessedEvents,
}

/// One live session. Run state is only changed through the registry.
pub struct SessionRecord {
    id: SessionId,
    created_at: Instant,
    created_at_ms: u64,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("session_key", &self.session_key())
            .field("active_run_id", &self.active_run_id())
            .finish_non_exhaustive()
    }
}

impl SessionRecord {
    fn new(id: SessionId, session_key: String, cwd: String, now: Instant, dedupe_max: usize) -> Self {
        Self {
            id,
            created_at: now,
            created_at_ms: clock::epoch_ms(),
            state: Mutex::new(SessionState {
                session_key,
                cwd,
                last_touched_at: now,
                active_run: None,
                processed: ProcessedEvents::new(dedupe_max),
            }),
        }
    }

    /// Registry key.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Creation instant. Unchanged by refresh.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current logical key.
    pub fn session_key(&self) -> String {
        self.state.lock().session_key.clone()
    }

    /// Current working directory.
    pub fn cwd(&self) -> String {
        self.state.lock().cwd.clone()
    }

    /// Last access.
    pub fn last_touched_at(&self) -> Instant {
        self.state.lock().last_touched_at
    }

    /// ID of the active run, if any.
    pub fn active_run_id(&self) -> Option<RunId> {
        self.state.lock().active_run.as_ref().map(|r| r.run_id.clone())
    }

    /// Cancellation token of the active run, if any.
    pub fn active_cancel_token(&self) -> Option<CancellationToken> {
        self.state.lock().active_run.as_ref().map(|r| r.cancel.clone())
    }

    /// No active run.
    pub fn is_idle(&self) -> bool {
        self.state.lock().active_run.is_none()
    }

    /// Serializable view.
    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let state = self.state.lock();
        #[allow(clippy::cast_possible_truncation)]
        let idle_ms = now.saturating_duration_since(state.last_touched_at).as_millis() as u64;
        SessionSnapshot {
            session_id: self.id.clone(),
            session_key: state.session_key.clone(),
            cwd: state.cwd.clone(),
            created_at_ms: self.created_at_ms,
            idle_ms,
            active_run_id: state.active_run.as_ref().map(|r| r.run_id.clone()),
        }
    }
}

/// Wire view of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Registry key.
    pub session_id: SessionId,
    /// Logical key.
    pub session_key: String,
    /// Working directory.
    pub cwd: String,
    /// Creation time, Unix epoch milliseconds.
    pub created_at_ms: u64,
    /// Milliseconds since last access.
    pub idle_ms: u64,
    /// Active run, if any.
    pub active_run_id: Option<RunId>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<SessionRecord>>,
    /// `run_id -> session_id`, kept in lockstep with every record's active run.
    run_index: HashMap<RunId, SessionId>,
}

/// Why a session left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// Idle longer than the TTL.
    Idle,
    /// Oldest idle session, evicted to make room.
    Capacity,
    /// Explicit reset.
    Reset,
}

impl RemovalReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capacity => "capacity",
            Self::Reset => "reset",
        }
    }
}

/// Authoritative map of live sessions.
pub struct SessionRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    events: Option<Arc<EventEmitter>>,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// Registry on the system clock.
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    /// Registry on a caller-supplied clock.
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            events: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Emit `session.removed` on every reap, eviction and reset.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventEmitter>) -> Self {
        self.events = Some(events);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current instant on the registry clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Create a session, or refresh the existing one with the same ID.
    ///
    /// New sessions first reap idle records, then evict the oldest idle one
    /// if the registry is still full. Sessions with an active run are never
    /// evicted: if all are busy the call fails with
    /// [`RuntimeError::SessionLimitReached`].
    pub fn create_session(&self, req: CreateSession) -> Result<CreatedSession, RuntimeError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if let Some(existing) = req.session_id.as_ref().and_then(|id| inner.sessions.get(id)) {
            let record = Arc::clone(existing);
            {
                let mut state = record.state.lock();
                state.session_key = req.session_key;
                state.cwd = req.cwd;
                state.last_touched_at = now;
            }
            debug!(session_id = %record.id, "session refreshed");
            return Ok(CreatedSession {
                record,
                refreshed: true,
                evicted: Vec::new(),
            });
        }

        let mut evicted = self.reap_idle_locked(&mut inner, now);

        while inner.sessions.len() >= self.config.max_sessions {
            let Some(victim) = oldest_idle(&inner) else {
                warn!(
                    max_sessions = self.config.max_sessions,
                    "session limit reached, all sessions busy"
                );
                counter!("sessions_rejected_total").increment(1);
                return Err(RuntimeError::SessionLimitReached {
                    max: self.config.max_sessions,
                });
            };
            let _ = self.remove_locked(&mut inner, &victim, RemovalReason::Capacity);
            evicted.push(victim);
        }

        let id = req.session_id.unwrap_or_default();
        let record = Arc::new(SessionRecord::new(
            id.clone(),
            req.session_key,
            req.cwd,
            now,
            self.config.processed_events_max,
        ));
        let _ = inner.sessions.insert(id.clone(), Arc::clone(&record));
        #[allow(clippy::cast_precision_loss)]
        gauge!("sessions_active").set(inner.sessions.len() as f64);
        info!(session_id = %id, session_key = %record.session_key(), "session created");

        Ok(CreatedSession {
            record,
            refreshed: false,
            evicted,
        })
    }

    /// Whether a session exists. Does not touch it.
    pub fn has_session(&self, id: &str) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    /// Look up and touch a session.
    pub fn get_session(&self, id: &str) -> Option<Arc<SessionRecord>> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let record = inner.sessions.get(id)?;
        record.state.lock().last_touched_at = now;
        Some(Arc::clone(record))
    }

    /// Look up and touch the session running `run_id`.
    pub fn get_session_by_run_id(&self, run_id: &str) -> Option<Arc<SessionRecord>> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let session_id = inner.run_index.get(run_id)?;
        let record = inner.sessions.get(session_id)?;
        record.state.lock().last_touched_at = now;
        Some(Arc::clone(record))
    }

    /// Most recently touched session bound to `session_key`. Touches it.
    pub fn find_by_key(&self, session_key: &str) -> Option<Arc<SessionRecord>> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let record = inner
            .sessions
            .values()
            .filter(|r| r.state.lock().session_key == session_key)
            .max_by_key(|r| r.state.lock().last_touched_at)?;
        record.state.lock().last_touched_at = now;
        Some(Arc::clone(record))
    }

    /// Mark `run_id` as the session's active run.
    ///
    /// Fails with [`RuntimeError::SessionBusy`] if another run is active.
    pub fn set_active_run(
        &self,
        id: &str,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let record = inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_owned()))?;
        {
            let mut state = record.state.lock();
            if state.active_run.is_some() {
                return Err(RuntimeError::SessionBusy(id.to_owned()));
            }
            state.active_run = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel,
            });
            state.last_touched_at = now;
        }
        debug!(session_id = id, run_id = %run_id, "active run set");
        let _ = inner.run_index.insert(run_id, record.id.clone());
        #[allow(clippy::cast_precision_loss)]
        gauge!("runs_active").set(inner.run_index.len() as f64);
        Ok(())
    }

    /// Clear the active run without cancelling it. Returns the cleared ID.
    pub fn clear_active_run(&self, id: &str) -> Option<RunId> {
        self.take_active_run(id, None, false)
    }

    /// Clear the active run only if it is still `run_id`.
    ///
    /// A run completing late must not clear a newer run on the same session.
    pub fn finish_run(&self, id: &str, run_id: &str) -> bool {
        self.take_active_run(id, Some(run_id), false).is_some()
    }

    /// Cancel and clear the active run. `false` if there was none.
    pub fn cancel_active_run(&self, id: &str) -> bool {
        self.take_active_run(id, None, true).is_some()
    }

    /// Cancel a run by its ID. Returns the session it belonged to.
    pub fn cancel_run(&self, run_id: &str) -> Option<SessionId> {
        let session_id = self.inner.lock().run_index.get(run_id).cloned()?;
        self.take_active_run(&session_id, Some(run_id), true)
            .map(|_| session_id)
    }

    fn take_active_run(&self, id: &str, expected: Option<&str>, cancel: bool) -> Option<RunId> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let record = inner.sessions.get(id).cloned()?;
        let run = {
            let mut state = record.state.lock();
            let matches = match (&state.active_run, expected) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(run), Some(expected)) => run.run_id.as_str() == expected,
            };
            if !matches {
                return None;
            }
            state.last_touched_at = now;
            state.active_run.take()?
        };
        if cancel {
            run.cancel.cancel();
            info!(session_id = id, run_id = %run.run_id, "active run cancelled");
        }
        let _ = inner.run_index.remove(&run.run_id);
        #[allow(clippy::cast_precision_loss)]
        gauge!("runs_active").set(inner.run_index.len() as f64);
        Some(run.run_id)
    }

    /// Remove a session, cancelling any active run.
    pub fn remove_session(&self, id: &str) -> Option<Arc<SessionRecord>> {
        let mut inner = self.inner.lock();
        let id = inner.sessions.get_key_value(id).map(|(k, _)| k.clone())?;
        self.remove_locked(&mut inner, &id, RemovalReason::Reset)
    }

    /// Remove idle sessions past the TTL. Returns their IDs.
    pub fn reap_idle(&self) -> Vec<SessionId> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.reap_idle_locked(&mut inner, now)
    }

    /// Record a dedupe key for a session. `Ok(false)` means already seen.
    pub fn mark_event_processed(&self, id: &str, dedupe_key: &str) -> Result<bool, RuntimeError> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let record = inner
            .sessions
            .get(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_owned()))?;
        let mut state = record.state.lock();
        state.last_touched_at = now;
        Ok(state.processed.insert(dedupe_key))
    }

    /// Forget a dedupe key. `false` if the session or key is gone.
    pub fn unmark_event_processed(&self, id: &str, dedupe_key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(id)
            .is_some_and(|record| record.state.lock().processed.remove(dedupe_key))
    }

    /// Snapshots of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let mut records: Vec<&Arc<SessionRecord>> = inner.sessions.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records.into_iter().map(|r| r.snapshot(now)).collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// No live sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions with an active run.
    pub fn active_run_count(&self) -> usize {
        self.inner.lock().run_index.len()
    }

    /// Periodically reap idle sessions until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap_idle();
                        if !reaped.is_empty() {
                            debug!(count = reaped.len(), "idle sweep reaped sessions");
                        }
                    }
                }
            }
        })
    }

    fn reap_idle_locked(&self, inner: &mut Inner, now: Instant) -> Vec<SessionId> {
        let ttl = self.config.idle_ttl;
        let stale: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|r| {
                let state = r.state.lock();
                state.active_run.is_none() && now.saturating_duration_since(state.last_touched_at) > ttl
            })
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            let _ = self.remove_locked(inner, id, RemovalReason::Idle);
        }
        stale
    }

    fn remove_locked(
        &self,
        inner: &mut Inner,
        id: &SessionId,
        reason: RemovalReason,
    ) -> Option<Arc<SessionRecord>> {
        let record = inner.sessions.remove(id)?;
        if let Some(run) = record.state.lock().active_run.take() {
            run.cancel.cancel();
            let _ = inner.run_index.remove(&run.run_id);
        }
        counter!("sessions_evicted_total", "reason" => reason.as_str()).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!("sessions_active").set(inner.sessions.len() as f64);
        info!(session_id = %id, reason = reason.as_str(), "session removed");
        if let Some(events) = &self.events {
            let _ = events.emit(GatewayEvent::for_session(
                id,
                names::SESSION_REMOVED,
                json!({ "sessionId": id, "reason": reason.as_str() }),
            ));
        }
        Some(record)
    }
}

fn oldest_idle(inner: &Inner) -> Option<SessionId> {
    inner
        .sessions
        .values()
        .filter_map(|r| {
            let state = r.state.lock();
            state
                .active_run
                .is_none()
                .then_some((state.last_touched_at, r.id.clone()))
        })
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, id)| id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
