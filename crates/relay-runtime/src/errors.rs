//! Runtime error types.

/// Errors raised by the registries and the run coordinator.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No session with this ID.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session already has an active run.
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// Registry is full and every session has an active run.
    #[error("Session limit reached ({max} sessions, none idle)")]
    SessionLimitReached {
        /// Configured soft cap.
        max: usize,
    },

    /// No run with this ID.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// No pending intent with this ID.
    #[error("Intent not found: {0}")]
    IntentNotFound(String),

    /// A waiter's channel closed before a decision arrived.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The run executor failed.
    #[error("Executor error: {0}")]
    Executor(String),

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether the caller can reasonably retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SessionBusy(_) | Self::SessionLimitReached { .. } | Self::Cancelled => true,
            Self::SessionNotFound(_)
            | Self::RunNotFound(_)
            | Self::IntentNotFound(_)
            | Self::ChannelClosed(_)
            | Self::Executor(_)
            | Self::Internal(_) => false,
        }
    }

    /// Short category for logs and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionBusy(_) => "session_busy",
            Self::SessionLimitReached { .. } => "capacity",
            Self::RunNotFound(_) => "run_not_found",
            Self::IntentNotFound(_) => "intent_not_found",
            Self::ChannelClosed(_) => "channel_closed",
            Self::Cancelled => "cancelled",
            Self::Executor(_) => "executor",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = RuntimeError::SessionLimitReached { max: 2 };
        assert_eq!(err.to_string(), "Session limit reached (2 sessions, none idle)");
        assert_eq!(
            RuntimeError::SessionBusy("s1".into()).to_string(),
            "Session busy: s1"
        );
    }

    #[test]
    fn categories() {
        assert_eq!(RuntimeError::SessionLimitReached { max: 1 }.category(), "capacity");
        assert_eq!(RuntimeError::Cancelled.category(), "cancelled");
        assert_eq!(RuntimeError::RunNotFound("r".into()).category(), "run_not_found");
    }

    #[test]
    fn recoverability() {
        assert!(RuntimeError::SessionBusy("s".into()).is_recoverable());
        assert!(RuntimeError::SessionLimitReached { max: 1 }.is_recoverable());
        assert!(!RuntimeError::SessionNotFound("s".into()).is_recoverable());
        assert!(!RuntimeError::Internal("x".into()).is_recoverable());
    }
}
