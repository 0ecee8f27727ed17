//! Error types for the engine.

use fieldsync_protocol::ConflictId;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Local storage error.
    #[error("store error: {0}")]
    Store(#[from] fieldsync_store::StoreError),

    /// Malformed message or impossible event shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No open conflict with the given id.
    #[error("no open conflict with id {conflict_id}")]
    ConflictNotFound {
        /// The id that was looked up.
        conflict_id: ConflictId,
    },

    /// The chosen resolution cannot apply to this conflict.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),
}

impl EngineError {
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

    /// Returns true if retrying the failed operation can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport { retryable: true, .. })
    }
}
