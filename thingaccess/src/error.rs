//! Error types for thingaccess.

use crate::{ConnError, SessionState};

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error type for session operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Connection could not be established; retry by running setup again.
    #[error("transport error: {0}")]
    Transport(String),

    /// Identity rejected by the gateway; not retryable.
    #[error("registration rejected: {0}")]
    Registration(String),

    /// Operation attempted outside the state that allows it.
    #[error("invalid state: {op} not allowed while {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    /// Identity is missing required fields.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Transport dropped while online.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A driver callback misbehaved.
    #[error("callback error: {0}")]
    Callback(String),
}

impl SessionError {
    /// Returns true if running the same step again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }

    pub(crate) fn invalid_state(op: &'static str, state: SessionState) -> Self {
        SessionError::InvalidState { op, state }
    }
}

impl From<ConnError> for SessionError {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::Rejected(reason) => SessionError::Registration(reason),
            other => SessionError::Transport(other.to_string()),
        }
    }
}

/// Best-effort telemetry dropped reports to stay within its queue bound.
///
/// Informational: returned alongside a successfully queued report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("telemetry overflow: {dropped} report(s) dropped")]
pub struct TelemetryOverflow {
    pub dropped: u64,
}
