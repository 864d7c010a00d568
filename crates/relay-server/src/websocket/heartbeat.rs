//! Liveness checks for connected clients.
//!
//! The write loop sends the pings; this task only watches whether anything
//! came back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ClientConnection;

/// Why the heartbeat task returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Nothing arrived for `missed` consecutive checks.
    Unresponsive {
        /// Checks without activity.
        missed: u32,
    },
    /// The connection closed for another reason.
    Stopped,
}

/// Consecutive silent checks tolerated before `timeout` is exceeded.
/// Never less than one.
pub fn allowed_misses(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Check `connection` every `interval` until it goes silent for longer than
/// `timeout` or `cancel` fires.
pub async fn watch_liveness(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatOutcome {
    let limit = allowed_misses(interval, timeout);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatOutcome::Stopped,
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                    continue;
                }
                missed += 1;
                debug!(conn_id = %connection.id, missed, limit, "no activity since last check");
                if missed >= limit {
                    return HeartbeatOutcome::Unresponsive { missed };
                }
            }
        }
    }
}
