//! # relay-runtime
//!
//! In-process coordination state for the gateway.
//!
//! - [`registry`]: session registry with idle reaping and capacity eviction
//! - [`runs`]: active-run tracking, idempotency, cancellation, event dedupe
//! - [`followups`]: per-session queues of messages waiting behind a run
//! - [`subagents`]: parent/child run hierarchy and cascading stop
//! - [`intents`]: two-phase registration for human-in-the-loop decisions
//! - [`events`]: broadcast of [`events::GatewayEvent`]s to the transport
//!
//! Every registry operation is synchronous and lock-scoped; only waiting
//! (for a run or a decision) suspends, and it never holds a lock.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod executor;
pub mod followups;
pub mod intents;
pub mod registry;
pub mod runs;
pub mod subagents;

use std::sync::Arc;
use std::time::Duration;

use relay_settings::GatewaySettings;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use errors::RuntimeError;
pub use events::{EventEmitter, GatewayEvent};
pub use executor::{EchoExecutor, RunContext, RunExecutor};

use followups::FollowupQueues;
use intents::IntentRegistry;
use registry::{RegistryConfig, SessionRegistry};
use runs::{RunConfig, RunCoordinator};
use subagents::{RuntimeControl, SubagentTracker};

/// All runtime state, wired together from settings.
#[derive(Clone)]
pub struct GatewayRuntime {
    /// Event fan-out.
    pub events: Arc<EventEmitter>,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Follow-up queues.
    pub followups: Arc<FollowupQueues>,
    /// Run coordination.
    pub runs: Arc<RunCoordinator>,
    /// Subagent hierarchy.
    pub subagents: Arc<SubagentTracker>,
    /// Pending approvals.
    pub intents: Arc<IntentRegistry>,
    /// Executes run bodies.
    pub executor: Arc<dyn RunExecutor>,
    /// Ended subagent entries older than this are dropped.
    pub subagent_archive_after: Duration,
    sweep_interval: Duration,
}

impl GatewayRuntime {
    /// Build the runtime from settings.
    pub fn new(settings: &GatewaySettings, executor: Arc<dyn RunExecutor>) -> Self {
        let events = Arc::new(EventEmitter::new());
        let registry = Arc::new(
            SessionRegistry::new(RegistryConfig::from_settings(&settings.registry, &settings.runs))
                .with_events(Arc::clone(&events)),
        );
        let followups = Arc::new(FollowupQueues::new());
        let runs = Arc::new(RunCoordinator::new(
            RunConfig::from_settings(&settings.runs),
            Arc::clone(&registry),
            Arc::clone(&followups),
            Arc::clone(&events),
        ));
        let intents = Arc::new(
            IntentRegistry::from_settings(&settings.approvals).with_events(Arc::clone(&events)),
        );
        Self {
            events,
            registry,
            followups,
            runs,
            subagents: Arc::new(SubagentTracker::new()),
            intents,
            executor,
            subagent_archive_after: Duration::from_millis(settings.subagents.archive_after_ms),
            sweep_interval: Duration::from_millis(settings.registry.sweep_interval_ms),
        }
    }

    /// Side-effect handle used by cascading stop.
    pub fn control(&self) -> RuntimeControl {
        RuntimeControl::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.runs),
            Arc::clone(&self.followups),
        )
    }

    /// Start the periodic maintenance task: idle reaping, intent expiry,
    /// idempotency expiry, and subagent archiving. Stops when `cancel` fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let runtime = self.clone();
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => runtime.sweep_once(),
                }
            }
        })
    }

    /// One maintenance pass.
    pub fn sweep_once(&self) {
        let reaped = self.registry.reap_idle();
        let expired = self.intents.sweep_expired();
        let keys = self.runs.sweep_expired();
        let archived = self.subagents.sweep(
            relay_core::clock::epoch_ms(),
            u64::try_from(self.subagent_archive_after.as_millis()).unwrap_or(u64::MAX),
        );
        for entry in &archived {
            if entry.cleanup == subagents::CleanupPolicy::Delete {
                if let Some(record) = self.registry.find_by_key(&entry.child_session_key) {
                    let _ = self.registry.remove_session(record.id());
                }
            }
        }
        if !reaped.is_empty() || expired > 0 || keys > 0 || !archived.is_empty() {
            tracing::debug!(
                reaped = reaped.len(),
                expired,
                keys,
                archived = archived.len(),
                "maintenance sweep"
            );
        }
    }
}
