//! Run coordinator: idempotent submission, cancellation, completion, and
//! inbound event dedupe.
//!
//! The coordinator's lock is always taken before the registry's, never the
//! other way around. Idempotency check and insertion happen under that one
//! lock, so two concurrent submissions with the same key cannot both start.
//! Keys are scoped to the session they were submitted for.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use relay_core::clock;
use relay_core::ids::{RunId, SessionId};
use relay_settings::RunSettings;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::RuntimeError;
use crate::events::{EventEmitter, GatewayEvent, names};
use crate::executor::{RunContext, RunExecutor};
use crate::followups::{FollowupItem, FollowupQueues};
use crate::registry::SessionRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Idempotency cache bounds.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// How long a key is remembered.
    pub idempotency_ttl: Duration,
    /// Maximum keys remembered.
    pub idempotency_max_entries: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_settings(&RunSettings::default())
    }
}

impl RunConfig {
    /// Build from the settings tree.
    pub fn from_settings(runs: &RunSettings) -> Self {
        Self {
            idempotency_ttl: Duration::from_millis(runs.idempotency_ttl_ms),
            idempotency_max_entries: runs.idempotency_max_entries,
        }
    }
}

/// Lifecycle of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Executing.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before finishing.
    Aborted,
}

impl RunStatus {
    /// Whether the run has ended.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Observable state of one run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Run ID.
    pub run_id: RunId,
    /// Owning session.
    pub session_id: SessionId,
    /// Current status.
    pub status: RunStatus,
    /// Result of a completed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error of a failed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Idempotency key the run was submitted with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Start time, Unix epoch milliseconds.
    pub started_at_ms: u64,
    /// End time, Unix epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
}

/// A run submission.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    /// Target session.
    pub session_id: SessionId,
    /// Input handed to the executor.
    pub input: Value,
    /// Retry-safe submission key.
    pub idempotency_key: Option<String>,
    /// Queue behind the active run instead of failing when busy.
    pub queue_if_busy: bool,
}

/// Outcome of a submission.
#[derive(Clone, Debug)]
pub enum Submission {
    /// A new run is active.
    Started {
        /// New run ID.
        run_id: RunId,
        /// Fires when the run is aborted.
        cancel: CancellationToken,
    },
    /// The idempotency key was already used; nothing new ran.
    Duplicate(RunRecord),
    /// The session was busy; the input waits in the follow-up queue.
    Queued {
        /// Queue depth after insertion.
        position: usize,
    },
}

/// How an executor finished.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// Result value.
    Completed(Value),
    /// Error message.
    Failed(String),
}

struct RunEntry {
    record: RunRecord,
    ended_at: Option<Instant>,
    done: watch::Sender<RunRecord>,
}

/// Idempotency keys are unique per session, not process-wide.
type IdempotencyKey = (SessionId, String);

struct IdempotencyEntry {
    run_id: RunId,
    inserted_at: Instant,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, RunEntry>,
    idempotency: HashMap<IdempotencyKey, IdempotencyEntry>,
    /// Keys in insertion order, for TTL and size pruning.
    idempotency_order: VecDeque<IdempotencyKey>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks runs on top of the session registry.
pub struct RunCoordinator {
    config: RunConfig,
    registry: Arc<SessionRegistry>,
    followups: Arc<FollowupQueues>,
    events: Arc<EventEmitter>,
    inner: Mutex<Inner>,
}

impl RunCoordinator {
    /// Create a coordinator.
    pub fn new(
        config: RunConfig,
        registry: Arc<SessionRegistry>,
        followups: Arc<FollowupQueues>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            config,
            registry,
            followups,
            events,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Underlying session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a new active run, or return the earlier run for an
    /// idempotency key this session already used.
    ///
    /// Does not execute anything; see [`RunCoordinator::start`].
    pub fn submit(&self, req: &RunRequest) -> Result<Submission, RuntimeError> {
        let now = self.registry.now();
        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner, now);

        let scoped_key = req
            .idempotency_key
            .as_ref()
            .map(|key| (req.session_id.clone(), key.clone()));
        if let Some(key) = &scoped_key {
            if let Some(existing) = inner
                .idempotency
                .get(key)
                .and_then(|e| inner.runs.get(&e.run_id))
            {
                counter!("runs_deduplicated_total").increment(1);
                debug!(
                    session_id = %req.session_id,
                    idempotency_key = key.1,
                    run_id = %existing.record.run_id,
                    "duplicate submission"
                );
                return Ok(Submission::Duplicate(existing.record.clone()));
            }
        }

        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        if let Err(err) = self
            .registry
            .set_active_run(&req.session_id, run_id.clone(), cancel.clone())
        {
            return match err {
                RuntimeError::SessionBusy(_) if req.queue_if_busy => self.enqueue(req),
                other => Err(other),
            };
        }

        let record = RunRecord {
            run_id: run_id.clone(),
            session_id: req.session_id.clone(),
            status: RunStatus::Running,
            result: None,
            error: None,
            idempotency_key: req.idempotency_key.clone(),
            started_at_ms: clock::epoch_ms(),
            ended_at_ms: None,
        };
        let (done, _) = watch::channel(record.clone());
        let _ = inner.runs.insert(
            run_id.clone(),
            RunEntry {
                record,
                ended_at: None,
                done,
            },
        );
        if let Some(key) = scoped_key {
            let _ = inner.idempotency.insert(
                key.clone(),
                IdempotencyEntry {
                    run_id: run_id.clone(),
                    inserted_at: now,
                },
            );
            inner.idempotency_order.push_back(key);
            self.prune_locked(&mut inner, now);
        }

        counter!("runs_started_total").increment(1);
        info!(session_id = %req.session_id, run_id = %run_id, "run started");
        let _ = self.events.emit(GatewayEvent::for_session(
            &req.session_id,
            names::RUN_STARTED,
            json!({ "sessionId": req.session_id, "runId": run_id }),
        ));
        Ok(Submission::Started { run_id, cancel })
    }

    fn enqueue(&self, req: &RunRequest) -> Result<Submission, RuntimeError> {
        let record = self
            .registry
            .get_session(&req.session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(req.session_id.to_string()))?;
        let session_key = record.session_key();
        if let Some(key) = req.idempotency_key.as_deref() {
            if self.followups.contains_idempotency_key(&session_key, key) {
                let position = self.followups.depth(&session_key);
                return Ok(Submission::Queued { position });
            }
        }
        let position = self.followups.enqueue(
            &session_key,
            FollowupItem {
                input: req.input.clone(),
                idempotency_key: req.idempotency_key.clone(),
            },
        );
        debug!(session_id = %req.session_id, position, "run queued behind active run");
        let _ = self.events.emit(GatewayEvent::for_session(
            &req.session_id,
            names::RUN_QUEUED,
            json!({ "sessionId": req.session_id, "position": position }),
        ));
        Ok(Submission::Queued { position })
    }

    /// Submit and, if a new run starts, drive it with `executor` on a
    /// spawned task. Queued follow-ups start when the run ends.
    pub fn start(
        self: &Arc<Self>,
        executor: Arc<dyn RunExecutor>,
        req: RunRequest,
    ) -> Result<Submission, RuntimeError> {
        let submission = self.submit(&req)?;
        if let Submission::Started { run_id, cancel } = &submission {
            let session_key = self
                .registry
                .get_session(&req.session_id)
                .map(|r| r.session_key())
                .unwrap_or_default();
            let ctx = RunContext {
                run_id: run_id.clone(),
                session_id: req.session_id.clone(),
                session_key,
                input: req.input,
                cancel: cancel.clone(),
                events: Arc::clone(&self.events),
            };
            let coordinator = Arc::clone(self);
            let _ = tokio::spawn(async move { coordinator.drive(executor, ctx).await });
        }
        Ok(submission)
    }

    async fn drive(self: Arc<Self>, executor: Arc<dyn RunExecutor>, ctx: RunContext) {
        let run_id = ctx.run_id.clone();
        let session_id = ctx.session_id.clone();
        let session_key = ctx.session_key.clone();
        let cancel = ctx.cancel.clone();

        let outcome = tokio::select! {
            () = cancel.cancelled() => None,
            result = executor.execute(ctx) => Some(result),
        };
        let _ = match outcome {
            None => self.mark_aborted(&run_id),
            Some(Ok(value)) => self.complete(&run_id, RunOutcome::Completed(value)),
            Some(Err(err)) => {
                warn!(run_id = %run_id, error = %err, "run failed");
                self.complete(&run_id, RunOutcome::Failed(err.to_string()))
            }
        };

        if let Some(next) = self.followups.drain_next(&session_key) {
            let req = RunRequest {
                session_id,
                input: next.input,
                idempotency_key: next.idempotency_key,
                queue_if_busy: true,
            };
            if let Err(err) = self.start(executor, req) {
                warn!(session_key, error = %err, "queued follow-up could not start");
            }
        }
    }

    /// Record the executor's outcome and clear the session's active run.
    ///
    /// A run that already ended (e.g. aborted) keeps its first outcome.
    #[instrument(skip(self, outcome))]
    pub fn complete(&self, run_id: &str, outcome: RunOutcome) -> Option<RunRecord> {
        let now = self.registry.now();
        let mut inner = self.inner.lock();
        let entry = inner.runs.get_mut(run_id)?;
        if entry.record.status.is_terminal() {
            return Some(entry.record.clone());
        }
        match outcome {
            RunOutcome::Completed(value) => {
                entry.record.status = RunStatus::Completed;
                entry.record.result = Some(value);
            }
            RunOutcome::Failed(message) => {
                entry.record.status = RunStatus::Failed;
                entry.record.error = Some(message);
            }
        }
        entry.record.ended_at_ms = Some(clock::epoch_ms());
        entry.ended_at = Some(now);
        let _ = self.registry.finish_run(&entry.record.session_id, run_id);
        let record = entry.record.clone();
        let _ = entry.done.send_replace(record.clone());

        counter!("runs_completed_total", "status" => status_label(record.status)).increment(1);
        info!(session_id = %record.session_id, status = status_label(record.status), "run ended");
        let _ = self.events.emit(GatewayEvent::for_session(
            &record.session_id,
            names::RUN_COMPLETED,
            json!({
                "sessionId": record.session_id,
                "runId": record.run_id,
                "status": record.status,
            }),
        ));
        Some(record)
    }

    /// Abort the session's active run. Returns the aborted run's ID.
    pub fn abort(&self, session_id: &str) -> Option<RunId> {
        let run_id = self.registry.get_session(session_id)?.active_run_id()?;
        self.abort_run(&run_id).then_some(run_id)
    }

    /// Abort a run by ID. `false` if it was not active.
    pub fn abort_run(&self, run_id: &str) -> bool {
        if self.registry.cancel_run(run_id).is_none() {
            return false;
        }
        let _ = self.mark_aborted(run_id);
        true
    }

    fn mark_aborted(&self, run_id: &str) -> Option<RunRecord> {
        let now = self.registry.now();
        let mut inner = self.inner.lock();
        let entry = inner.runs.get_mut(run_id)?;
        if entry.record.status.is_terminal() {
            return Some(entry.record.clone());
        }
        entry.record.status = RunStatus::Aborted;
        entry.record.ended_at_ms = Some(clock::epoch_ms());
        entry.ended_at = Some(now);
        // Covers cancellation that bypassed abort_run (session reset).
        let _ = self.registry.finish_run(&entry.record.session_id, run_id);
        let record = entry.record.clone();
        let _ = entry.done.send_replace(record.clone());

        counter!("runs_completed_total", "status" => "aborted").increment(1);
        info!(session_id = %record.session_id, run_id, "run aborted");
        let _ = self.events.emit(GatewayEvent::for_session(
            &record.session_id,
            names::RUN_ABORTED,
            json!({ "sessionId": record.session_id, "runId": record.run_id }),
        ));
        Some(record)
    }

    /// Current state of a run.
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.inner.lock().runs.get(run_id).map(|e| e.record.clone())
    }

    /// Wait up to `timeout` for a run to end. Returns the latest record
    /// either way; check `status` to tell them apart.
    pub async fn wait(&self, run_id: &str, timeout: Duration) -> Result<RunRecord, RuntimeError> {
        let mut rx = {
            let inner = self.inner.lock();
            inner
                .runs
                .get(run_id)
                .ok_or_else(|| RuntimeError::RunNotFound(run_id.to_owned()))?
                .done
                .subscribe()
        };
        let waited = tokio::time::timeout(timeout, rx.wait_for(|r| r.status.is_terminal()))
            .await
            .map(|res| res.map(|record| record.clone()));
        match waited {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) => Err(RuntimeError::ChannelClosed(format!(
                "run {run_id} was pruned while waiting"
            ))),
            Err(_elapsed) => Ok(rx.borrow().clone()),
        }
    }

    /// Dedupe an inbound at-least-once event for a session.
    ///
    /// The dedupe key falls back to the event ID. `Ok(false)` means the event
    /// was already processed and must be dropped before any state change.
    pub fn accept_event(
        &self,
        session_id: &str,
        event_id: &str,
        dedupe_key: Option<&str>,
    ) -> Result<bool, RuntimeError> {
        let key = dedupe_key.unwrap_or(event_id);
        let fresh = self.registry.mark_event_processed(session_id, key)?;
        if !fresh {
            counter!("events_deduplicated_total").increment(1);
            debug!(session_id, dedupe_key = key, "duplicate event dropped");
        }
        Ok(fresh)
    }

    /// Forget a dedupe mark so the event can be delivered again.
    ///
    /// Used when an accepted event failed before any state changed.
    pub fn release_event(
        &self,
        session_id: &str,
        event_id: &str,
        dedupe_key: Option<&str>,
    ) -> bool {
        let key = dedupe_key.unwrap_or(event_id);
        let released = self.registry.unmark_event_processed(session_id, key);
        if released {
            debug!(session_id, dedupe_key = key, "dedupe mark released");
        }
        released
    }

    /// Remembered idempotency keys.
    pub fn idempotency_len(&self) -> usize {
        self.inner.lock().idempotency.len()
    }

    /// Drop expired idempotency keys and ended runs past their TTL.
    /// Returns how many keys were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.registry.now();
        let mut inner = self.inner.lock();
        let before = inner.idempotency.len();
        self.prune_locked(&mut inner, now);
        before - inner.idempotency.len()
    }

    fn prune_locked(&self, inner: &mut Inner, now: Instant) {
        let ttl = self.config.idempotency_ttl;
        while let Some(key) = inner.idempotency_order.front() {
            let expired = inner
                .idempotency
                .get(key)
                .is_none_or(|e| now.saturating_duration_since(e.inserted_at) > ttl);
            let over_cap = inner.idempotency.len() > self.config.idempotency_max_entries;
            if !expired && !over_cap {
                break;
            }
            if let Some(key) = inner.idempotency_order.pop_front() {
                let _ = inner.idempotency.remove(&key);
            }
        }
        inner.runs.retain(|_, entry| {
            entry
                .ended_at
                .is_none_or(|ended| now.saturating_duration_since(ended) <= ttl)
        });
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Aborted => "aborted",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
