//! RPC error codes and error type.

use relay_core::protocol::ErrorBody;
use relay_runtime::RuntimeError;

// ── Error code constants ────────────────────────────────────────────

/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Frame was not a request.
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Method not found in the registry.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Handler exceeded its time limit.
pub const TIMEOUT: &str = "TIMEOUT";
/// Session does not exist.
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
/// Session already has an active run.
pub const SESSION_BUSY: &str = "SESSION_BUSY";
/// Registry is full and no session is idle.
pub const SESSION_LIMIT_REACHED: &str = "SESSION_LIMIT_REACHED";
/// Run does not exist.
pub const RUN_NOT_FOUND: &str = "RUN_NOT_FOUND";
/// Intent does not exist.
pub const INTENT_NOT_FOUND: &str = "INTENT_NOT_FOUND";
/// Feature or resource not available in this context.
pub const NOT_AVAILABLE: &str = "NOT_AVAILABLE";
/// Operation was cancelled.
pub const CANCELLED: &str = "CANCELLED";
/// Run executor failed.
pub const EXECUTOR_ERROR: &str = "EXECUTOR_ERROR";

/// RPC error type returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Requested resource not found.
    #[error("{message}")]
    NotFound {
        /// Specific error code (e.g. `SESSION_NOT_FOUND`).
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Internal server error. The message is logged, not sent.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Domain-specific error with arbitrary code.
    #[error("{message}")]
    Custom {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Optional structured details.
        details: Option<serde_json::Value>,
    },
}

impl RpcError {
    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::NotFound { code, .. } | Self::Custom { code, .. } => code,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: super::validation::sanitize_error_message(self),
            details: match self {
                Self::Custom { details, .. } => details.clone(),
                _ => None,
            },
        }
    }
}

impl From<RuntimeError> for RpcError {
    fn from(err: RuntimeError) -> Self {
        let message = err.to_string();
        match err {
            RuntimeError::SessionNotFound(_) => Self::NotFound {
                code: SESSION_NOT_FOUND.into(),
                message,
            },
            RuntimeError::RunNotFound(_) => Self::NotFound {
                code: RUN_NOT_FOUND.into(),
                message,
            },
            RuntimeError::IntentNotFound(_) => Self::NotFound {
                code: INTENT_NOT_FOUND.into(),
                message,
            },
            RuntimeError::SessionBusy(_) => Self::Custom {
                code: SESSION_BUSY.into(),
                message,
                details: None,
            },
            RuntimeError::SessionLimitReached { max } => Self::Custom {
                code: SESSION_LIMIT_REACHED.into(),
                message,
                details: Some(serde_json::json!({ "maxSessions": max })),
            },
            RuntimeError::Cancelled => Self::Custom {
                code: CANCELLED.into(),
                message,
                details: None,
            },
            RuntimeError::Executor(_) => Self::Custom {
                code: EXECUTOR_ERROR.into(),
                message,
                details: None,
            },
            RuntimeError::ChannelClosed(_) | RuntimeError::Internal(_) => {
                Self::Internal { message }
            }
        }
    }
}
