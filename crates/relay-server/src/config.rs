//! Server configuration.

use std::time::Duration;

use relay_settings::{AuthSettings, ServerSettings};

/// Heartbeat timeout, as a multiple of the ping interval.
const MISSED_PINGS_BEFORE_CLOSE: u32 = 3;

/// Runtime configuration for the gateway server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Close a connection after this long without a pong.
    pub heartbeat_timeout: Duration,
    /// Time allowed between upgrade and a valid `hello`.
    pub handshake_timeout: Duration,
    /// Max inbound WebSocket message size in bytes.
    pub max_payload_bytes: usize,
    /// Per-connection outbound queue depth.
    pub outbound_buffer: usize,
    /// Handler time limit for requests without `timeoutMs`.
    pub request_timeout: Duration,
    /// How long shutdown waits for tasks to drain.
    pub shutdown_timeout: Duration,
    /// Accepted credentials.
    pub auth: AuthSettings,
}

impl ServerConfig {
    /// Build from the settings tree.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        let heartbeat_interval = Duration::from_millis(settings.heartbeat_interval_ms);
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * MISSED_PINGS_BEFORE_CLOSE,
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
            max_payload_bytes: settings.max_payload_bytes,
            outbound_buffer: settings.outbound_buffer.max(1),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
            auth: settings.auth.clone(),
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    /// Settings defaults, but on an ephemeral port.
    fn default() -> Self {
        Self {
            port: 0,
            ..Self::from_settings(&ServerSettings::default())
        }
    }
}
