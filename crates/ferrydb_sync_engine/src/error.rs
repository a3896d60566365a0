//! Error types for the sync engine.

use ferrydb_core::CoreError;
use ferrydb_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or transport failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed remote response or schema mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed after any interceptor-driven replay.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Local store failure.
    #[error("store error: {0}")]
    Storage(#[from] CoreError),

    /// Cooperative cancellation was observed.
    #[error("replication cancelled")]
    Cancelled,

    /// An operation was invalid for the replicator's current state.
    #[error("illegal state: cannot {action} from {state}")]
    IllegalState {
        /// The attempted operation.
        action: &'static str,
        /// The state it was attempted from.
        state: String,
    },

    /// An HTTP call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::transport_fatal("bad request").is_retryable());
        assert!(!SyncError::protocol("garbled body").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Auth("401".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::IllegalState {
            action: "start",
            state: "Complete".into(),
        };
        assert_eq!(err.to_string(), "illegal state: cannot start from Complete");
    }
}
