//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred (includes quota exhaustion).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The store file is corrupted beyond the recoverable tail.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store's exclusive lock.
    #[error("store locked: another process has exclusive access")]
    Locked,
}
