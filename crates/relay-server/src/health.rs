//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Live counters sampled for a health report.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayCounts {
    /// Open WebSocket connections.
    pub connections: usize,
    /// Sessions in the registry.
    pub sessions: usize,
    /// Sessions with an active run.
    pub runs: usize,
    /// Approval intents still waiting for a decision.
    pub pending_approvals: usize,
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` whenever the server answers.
    pub status: &'static str,
    /// Server crate version.
    pub version: &'static str,
    /// Whole seconds since start.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Sessions in the registry.
    pub active_sessions: usize,
    /// Sessions with an active run.
    pub active_runs: usize,
    /// Undecided approval intents.
    pub pending_approvals: usize,
}

impl HealthResponse {
    /// Report for a server started at `started`.
    pub fn new(started: Instant, counts: GatewayCounts) -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: started.elapsed().as_secs(),
            connections: counts.connections,
            active_sessions: counts.sessions,
            active_runs: counts.runs,
            pending_approvals: counts.pending_approvals,
        }
    }
}
