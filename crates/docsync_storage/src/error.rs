//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store cannot be used at all (quota, private mode, missing driver).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The stored data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A batch commit failed; nothing from the batch was applied.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// The store is closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns true if the engine should fall back to memory-only mode.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Closed)
    }
}
