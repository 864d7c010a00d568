//! Typed settings tree.
//!
//! Every struct is `#[serde(default)]`, so a settings file only needs the
//! keys it changes.

use relay_core::backoff::ReconnectPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root of the settings tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener and connection settings.
    pub server: ServerSettings,
    /// Session registry capacity and idle policy.
    pub registry: RegistrySettings,
    /// Run idempotency and event dedupe bounds.
    pub runs: RunSettings,
    /// Subagent bookkeeping.
    pub subagents: SubagentSettings,
    /// Two-phase approval defaults.
    pub approvals: ApprovalSettings,
    /// Transport client defaults used by `relay-gateway call`.
    pub client: ClientSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject contradictory or out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.server.auth.token.is_some() && self.server.auth.password.is_some() {
            return Err(SettingsError::InvalidValue(
                "server.auth: token and password are mutually exclusive".into(),
            ));
        }
        if self.registry.max_sessions == 0 {
            return Err(SettingsError::InvalidValue(
                "registry.maxSessions must be at least 1".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        let reconnect = &self.client.reconnect;
        if reconnect.factor < 1.0 {
            return Err(SettingsError::InvalidValue(format!(
                "client.reconnect.factor must be >= 1.0, got {}",
                reconnect.factor
            )));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(SettingsError::InvalidValue(format!(
                "client.reconnect.jitter must be within 0.0..=1.0, got {}",
                reconnect.jitter
            )));
        }
        if reconnect.initial_ms > reconnect.max_ms {
            return Err(SettingsError::InvalidValue(
                "client.reconnect.initialMs exceeds maxMs".into(),
            ));
        }
        Ok(())
    }
}

/// Shared-secret credentials the server accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AuthSettings {
    /// Whether any credential is configured.
    pub fn is_configured(&self) -> bool {
        self.token.is_some() || self.password.is_some()
    }
}

/// Gateway listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks a free port.
    pub port: u16,
    /// Simultaneous WebSocket connections accepted.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval_ms: u64,
    /// Time a new connection has to complete the handshake.
    pub handshake_timeout_ms: u64,
    /// Largest inbound message accepted.
    pub max_payload_bytes: usize,
    /// Per-connection outbound queue depth.
    pub outbound_buffer: usize,
    /// Handler time limit when the request has no `timeoutMs`.
    pub request_timeout_ms: u64,
    /// How long shutdown waits for tasks to drain.
    pub shutdown_timeout_ms: u64,
    /// Accepted credentials. Empty means no authentication.
    pub auth: AuthSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18_789,
            max_connections: 256,
            heartbeat_interval_ms: 30_000,
            handshake_timeout_ms: relay_core::protocol::HANDSHAKE_TIMEOUT_MS,
            max_payload_bytes: 1_048_576,
            outbound_buffer: 256,
            request_timeout_ms: 60_000,
            shutdown_timeout_ms: 5_000,
            auth: AuthSettings::default(),
        }
    }
}

/// Session registry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Soft cap on live sessions.
    pub max_sessions: usize,
    /// Idle sessions untouched this long are reaped.
    pub idle_ttl_ms: u64,
    /// Interval of the background idle sweep.
    pub sweep_interval_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            idle_ttl_ms: 1_800_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Run coordinator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSettings {
    /// How long an idempotency key is remembered.
    pub idempotency_ttl_ms: u64,
    /// Maximum remembered idempotency keys.
    pub idempotency_max_entries: usize,
    /// Maximum dedupe keys remembered per session.
    pub processed_events_max: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            idempotency_ttl_ms: 300_000,
            idempotency_max_entries: 1_000,
            processed_events_max: 1_000,
        }
    }
}

/// Subagent tracker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentSettings {
    /// Ended entries older than this are dropped by the sweep.
    pub archive_after_ms: u64,
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self {
            archive_after_ms: 3_600_000,
        }
    }
}

/// Two-phase approval settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalSettings {
    /// Lifetime of an approval when the request names none.
    pub default_timeout_ms: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000,
        }
    }
}

/// Transport client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Default per-request timeout.
    pub request_timeout_ms: u64,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789/ws".to_string(),
            request_timeout_ms: 30_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_validate() {
        GatewaySettings::default().validate().unwrap();
    }

    #[test]
    fn default_values() {
        let s = GatewaySettings::default();
        assert_eq!(s.server.port, 18_789);
        assert_eq!(s.server.handshake_timeout_ms, 10_000);
        assert_eq!(s.runs.idempotency_ttl_ms, 300_000);
        assert_eq!(s.runs.idempotency_max_entries, 1_000);
        assert!(!s.server.auth.is_configured());
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let s: GatewaySettings =
            serde_json::from_str(r#"{"registry": {"maxSessions": 2}}"#).unwrap();
        assert_eq!(s.registry.max_sessions, 2);
        assert_eq!(s.registry.idle_ttl_ms, 1_800_000);
        assert_eq!(s.server.port, 18_789);
    }

    #[test]
    fn token_and_password_conflict() {
        let mut s = GatewaySettings::default();
        s.server.auth.token = Some("t".into());
        s.server.auth.password = Some("p".into());
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("mutually exclusive"));
    }

    #[test]
    fn zero_sessions_rejected() {
        let mut s = GatewaySettings::default();
        s.registry.max_sessions = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn bad_reconnect_values_rejected() {
        let mut s = GatewaySettings::default();
        s.client.reconnect.factor = 0.5;
        assert!(s.validate().is_err());

        let mut s = GatewaySettings::default();
        s.client.reconnect.jitter = 1.5;
        assert!(s.validate().is_err());

        let mut s = GatewaySettings::default();
        s.client.reconnect.initial_ms = 60_000;
        assert!(s.validate().is_err());
    }
}
