//! Client error types.

use relay_core::protocol::{CloseCode, ErrorBody};
use serde_json::Value;

/// Errors surfaced by [`crate::GatewayClient`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// Bad frame, failed handshake, or no common protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server closed with a session or resource conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The connection dropped while the request was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No response within the request's deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Method that timed out.
        method: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// Reconnect budget exhausted.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// The server answered with an error.
    #[error("{code}: {message}")]
    Rejected {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// Structured details.
        details: Option<Value>,
    },

    /// The client was stopped.
    #[error("client stopped")]
    Stopped,

    /// Options failed validation.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    /// A payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Error for a close code that ends the client for good, or `None`
    /// when the close is retryable.
    pub fn from_terminal_close(code: CloseCode, reason: &str) -> Option<Self> {
        if code.is_retryable() {
            return None;
        }
        let reason = if reason.is_empty() {
            code.reason().to_owned()
        } else {
            reason.to_owned()
        };
        Some(match code {
            CloseCode::AuthFailed => Self::Auth(reason),
            CloseCode::VersionMismatch | CloseCode::InvalidHello => Self::Protocol(reason),
            CloseCode::Conflict => Self::Conflict(reason),
            _ => Self::ConnectionLost(reason),
        })
    }

    /// Whether the error ends the client rather than one request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Auth(_)
                | Self::Conflict(_)
                | Self::ReconnectExhausted { .. }
                | Self::Stopped
                | Self::InvalidConfig(_)
        )
    }
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        Self::Rejected {
            code: body.code,
            message: body.message,
            details: body.details,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
