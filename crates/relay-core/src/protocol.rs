//! Gateway wire protocol.
//!
//! Every WebSocket text message is one JSON [`Frame`], tagged by `"type"`:
//!
//! | type      | direction        | purpose                                  |
//! |-----------|------------------|------------------------------------------|
//! | `hello`   | client → server  | identify, authenticate, propose versions |
//! | `helloOk` | server → client  | negotiated version, capabilities         |
//! | `req`     | client → server  | method call, correlated by `id`          |
//! | `res`     | server → client  | result or error for one `req`            |
//! | `event`   | server → client  | broadcast payload with per-connection `seq` |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, RequestId};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 3;
/// Oldest protocol version the server still accepts.
pub const MIN_PROTOCOL: u32 = 1;
/// Newest protocol version the server accepts.
pub const MAX_PROTOCOL: u32 = PROTOCOL_VERSION;
/// How long a fresh connection may take to send its `hello`.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

// ── Handshake ───────────────────────────────────────────────────────

/// Kind of peer on the other end of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMode {
    /// One-shot command line invocation.
    Cli,
    /// Interactive terminal or graphical UI.
    Ui,
    /// Remote node host.
    Node,
    /// Another process relaying through the gateway (channel adapters, cron).
    GatewayClient,
}

impl ClientMode {
    /// Wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Ui => "ui",
            Self::Node => "node",
            Self::GatewayClient => "gateway-client",
        }
    }
}

/// Credential presented in `hello`. At most one of the two is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    /// Shared bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Shared password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// First frame a client sends after the socket opens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Short machine name of the client program.
    pub client_name: String,
    /// Human-readable client name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_display_name: Option<String>,
    /// Client program version.
    pub client_version: String,
    /// Operating system or runtime of the client.
    pub platform: String,
    /// Kind of client.
    pub mode: ClientMode,
    /// Optional feature flags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Stable per-install identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Lowest protocol version the client speaks.
    pub min_protocol: u32,
    /// Highest protocol version the client speaks.
    pub max_protocol: u32,
    /// Credential, if the server requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthCredential>,
}

/// Server identity advertised in `helloOk`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server build version.
    pub version: String,
    /// Host name the server runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Connection limits the client should respect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPolicy {
    /// Interval between server pings.
    pub heartbeat_interval_ms: u64,
    /// Largest accepted inbound message.
    pub max_payload_bytes: usize,
}

/// Successful handshake reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    /// Version both sides will speak.
    pub protocol_version: u32,
    /// Server-assigned connection ID.
    pub connection_id: ConnectionId,
    /// Optional feature flags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Server identity.
    pub server: ServerInfo,
    /// Limits for this connection.
    pub policy: ConnectionPolicy,
}

// ── Request / response / event ──────────────────────────────────────

/// A method call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    /// Correlation ID, unique among the connection's in-flight requests.
    pub id: RequestId,
    /// Method name, e.g. `session.create`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Caller's deadline; the server bounds handler time by it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Error payload of a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Reply to exactly one [`RequestFrame`], carrying its `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// ID of the request being answered.
    pub id: RequestId,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    /// Successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(id: RequestId, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
        }
    }

    /// Split into the result or the error body. A response with neither
    /// resolves to `null`.
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Broadcast event. `seq` is assigned per connection at send time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name, e.g. `run.started`.
    pub event: String,
    /// Event payload.
    pub payload: Value,
    /// Per-connection sequence number, starting at 1.
    pub seq: u64,
}

/// Any frame on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Client handshake.
    Hello(Hello),
    /// Handshake accepted.
    HelloOk(HelloOk),
    /// Method call.
    Req(RequestFrame),
    /// Method reply.
    Res(ResponseFrame),
    /// Broadcast event.
    Event(EventFrame),
}

impl Frame {
    /// Parse one text message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }

    /// Serialize to a text message.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Malformed)
    }

    /// Frame type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::HelloOk(_) => "helloOk",
            Self::Req(_) => "req",
            Self::Res(_) => "res",
            Self::Event(_) => "event",
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────

/// Framing and negotiation failures. Fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Text was not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Client's proposed range was empty.
    #[error("invalid protocol range {min}..={max}")]
    InvalidRange {
        /// Proposed minimum.
        min: u32,
        /// Proposed maximum.
        max: u32,
    },

    /// No version in common.
    #[error(
        "protocol version mismatch: client supports {client_min}..={client_max}, server supports {server_min}..={server_max}"
    )]
    VersionMismatch {
        /// Client minimum.
        client_min: u32,
        /// Client maximum.
        client_max: u32,
        /// Server minimum.
        server_min: u32,
        /// Server maximum.
        server_max: u32,
    },
}

/// Pick the highest version both sides support.
pub fn negotiate_protocol(
    client_min: u32,
    client_max: u32,
    server_min: u32,
    server_max: u32,
) -> Result<u32, ProtocolError> {
    if client_min > client_max {
        return Err(ProtocolError::InvalidRange {
            min: client_min,
            max: client_max,
        });
    }
    let low = client_min.max(server_min);
    let high = client_max.min(server_max);
    if low > high {
        return Err(ProtocolError::VersionMismatch {
            client_min,
            client_max,
            server_min,
            server_max,
        });
    }
    Ok(high)
}

// ── Close codes ─────────────────────────────────────────────────────

/// WebSocket close codes used by the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: intentional close.
    Normal,
    /// 1001: server shutting down or client navigating away.
    GoingAway,
    /// 1011: unexpected server failure.
    Internal,
    /// 1013: server at connection capacity.
    TryAgainLater,
    /// 4001: credential rejected.
    AuthFailed,
    /// 4002: no protocol version in common.
    VersionMismatch,
    /// 4003: no `hello` within the handshake window.
    HandshakeFailed,
    /// 4004: first frame was not a well-formed `hello`. Not retried.
    InvalidHello,
    /// 4009: session or resource conflict.
    Conflict,
    /// Anything else.
    Other(u16),
}

impl CloseCode {
    /// Numeric wire value.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::Internal => 1011,
            Self::TryAgainLater => 1013,
            Self::AuthFailed => 4001,
            Self::VersionMismatch => 4002,
            Self::HandshakeFailed => 4003,
            Self::InvalidHello => 4004,
            Self::Conflict => 4009,
            Self::Other(code) => code,
        }
    }

    /// Whether a client should reconnect after this close.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::Normal
                | Self::AuthFailed
                | Self::VersionMismatch
                | Self::InvalidHello
                | Self::Conflict
        )
    }

    /// Default close reason text.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "going away",
            Self::Internal => "internal error",
            Self::TryAgainLater => "server at capacity",
            Self::AuthFailed => "authentication failed",
            Self::VersionMismatch => "protocol version mismatch",
            Self::HandshakeFailed => "handshake failed",
            Self::InvalidHello => "invalid hello",
            Self::Conflict => "session conflict",
            Self::Other(_) => "closed",
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1011 => Self::Internal,
            1013 => Self::TryAgainLater,
            4001 => Self::AuthFailed,
            4002 => Self::VersionMismatch,
            4003 => Self::HandshakeFailed,
            4004 => Self::InvalidHello,
            4009 => Self::Conflict,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.code()
    }
}
