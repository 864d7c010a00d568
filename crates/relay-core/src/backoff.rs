//! Reconnect backoff.
//!
//! [`ReconnectPolicy`] holds the parameters, [`delay_with_random`] is the
//! pure math, and [`Backoff`] counts attempts for one reconnect cycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default first delay in milliseconds.
pub const DEFAULT_INITIAL_MS: u64 = 1_000;
/// Default delay cap in milliseconds.
pub const DEFAULT_MAX_MS: u64 = 30_000;
/// Default growth factor per attempt.
pub const DEFAULT_FACTOR: f64 = 2.0;
/// Default jitter fraction (0.0–1.0).
pub const DEFAULT_JITTER: f64 = 0.2;
/// Default attempt budget before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Reconnect backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_ms: u64,
    /// Upper bound on the un-jittered delay.
    pub max_ms: u64,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Symmetric jitter fraction: 0.2 means ±20%.
    pub jitter: f64,
    /// Attempts allowed before the failure becomes terminal.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_INITIAL_MS,
            max_ms: DEFAULT_MAX_MS,
            factor: DEFAULT_FACTOR,
            jitter: DEFAULT_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Delay for zero-based `attempt`, before jitter.
///
/// `min(max_ms, initial_ms * factor^attempt)`
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn capped_delay(policy: &ReconnectPolicy, attempt: u32) -> u64 {
    let factor = policy.factor.max(1.0);
    let exponential = (policy.initial_ms as f64) * factor.powi(attempt.min(63) as i32);
    if !exponential.is_finite() || exponential >= policy.max_ms as f64 {
        return policy.max_ms;
    }
    exponential.round() as u64
}

/// Delay for zero-based `attempt` with caller-supplied randomness.
///
/// `random` should be in `[0.0, 1.0)`; it maps to `[-jitter, +jitter]`
/// around the capped delay.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn delay_with_random(policy: &ReconnectPolicy, attempt: u32, random: f64) -> u64 {
    let capped = capped_delay(policy, attempt);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let scale = 1.0 + (random * 2.0 - 1.0) * jitter;
    ((capped as f64) * scale).round().max(0.0) as u64
}

/// Attempt counter for one reconnect cycle.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start a fresh cycle.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let ms = delay_with_random(&self.policy, self.attempt, rand::random::<f64>());
        self.attempt += 1;
        Some(Duration::from_millis(ms))
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget consumed attempts (after a successful handshake).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Parameters of this cycle.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
