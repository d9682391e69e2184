//! Error types for docsync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the data model and the local store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] docsync_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] docsync_codec::CodecError),

    /// A caller supplied a malformed mutation, query or argument.
    ///
    /// Validation errors are raised before anything is written.
    #[error("invalid argument: {message}")]
    Validation {
        /// Description of the problem.
        message: String,
    },

    /// A path string could not be parsed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Persisted state could not be decoded.
    #[error("corrupted persisted state: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// An internal invariant was violated, e.g. an out-of-order
    /// acknowledgement.
    #[error("internal invariant violated: {message}")]
    Fatal {
        /// Description of the violation.
        message: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a fatal invariant violation.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the error was caused by caller input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::InvalidPath { .. })
    }

    /// Returns true if the engine must stop accepting writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Corrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CoreError::validation("bad").is_validation());
        assert!(CoreError::invalid_path("a//b", "empty segment").is_validation());
        assert!(CoreError::fatal("out of order").is_fatal());
        assert!(CoreError::corrupted("bad cbor").is_fatal());
        assert!(!CoreError::validation("bad").is_fatal());
    }

    #[test]
    fn display_messages() {
        let err = CoreError::fatal("batch 3 acknowledged before batch 2");
        assert_eq!(
            err.to_string(),
            "internal invariant violated: batch 3 acknowledged before batch 2"
        );
    }
}
