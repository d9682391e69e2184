//! Error types for the sync engine.

use docsync_core::CoreError;
use docsync_sync_protocol::{Code, ProtocolError, Status};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a [`SyncError`].
///
/// Transport and consistency failures are recovered internally by retrying
/// or re-listening; validation failures surface at the call that caused
/// them; fatal failures stop the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller supplied a malformed argument.
    Validation,
    /// The network or storage failed transiently.
    Transport,
    /// Credentials were missing, expired or insufficient.
    Authentication,
    /// Local and remote state disagree.
    Consistency,
    /// An internal invariant was violated.
    Fatal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The backend rejected a request.
    #[error("backend error: {0}")]
    Backend(Status),

    /// Local store error.
    #[error("local store error: {0}")]
    Core(#[from] CoreError),

    /// Protocol payload error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The caller supplied a malformed argument.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The requested data is not available offline.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An internal invariant was violated; the engine has stopped.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The engine was terminated.
    #[error("the document store has been terminated")]
    Terminated,
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

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Wraps a backend status.
    pub fn backend(code: Code, message: impl Into<String>) -> Self {
        Self::Backend(Status::new(code, message))
    }

    /// Returns the backend status code, if the backend produced the error.
    pub fn code(&self) -> Option<Code> {
        match self {
            SyncError::Backend(status) => Some(status.code),
            _ => None,
        }
    }

    /// Returns the error's classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport { .. } | SyncError::Unavailable(_) => ErrorKind::Transport,
            SyncError::Backend(status) => match status.code {
                Code::Unauthenticated | Code::PermissionDenied => ErrorKind::Authentication,
                Code::Aborted | Code::FailedPrecondition | Code::AlreadyExists | Code::NotFound => {
                    ErrorKind::Consistency
                }
                Code::InvalidArgument | Code::OutOfRange | Code::Unimplemented => {
                    ErrorKind::Validation
                }
                Code::DataLoss => ErrorKind::Fatal,
                _ => ErrorKind::Transport,
            },
            SyncError::Core(e) if e.is_validation() => ErrorKind::Validation,
            SyncError::Core(e) if e.is_fatal() => ErrorKind::Fatal,
            SyncError::Core(_) => ErrorKind::Transport,
            SyncError::Protocol(_) => ErrorKind::Consistency,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Fatal(_) | SyncError::Terminated => ErrorKind::Fatal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Backend(status) => !status.code.is_permanent_error(),
            SyncError::Core(CoreError::Storage(_)) => true,
            _ => false,
        }
    }

    /// Returns true if the engine cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Returns true if the backend will reject the same request again.
    pub fn is_permanent(&self) -> bool {
        match self {
            SyncError::Backend(status) => status.code.is_permanent_error(),
            _ => !self.is_retryable(),
        }
    }

    /// Returns a copy suitable for delivering to several listeners.
    pub(crate) fn duplicate(&self) -> SyncError {
        match self {
            SyncError::Transport { message, retryable } => SyncError::Transport {
                message: message.clone(),
                retryable: *retryable,
            },
            SyncError::Backend(status) => SyncError::Backend(status.clone()),
            SyncError::Validation(message) => SyncError::Validation(message.clone()),
            SyncError::Unavailable(message) => SyncError::Unavailable(message.clone()),
            SyncError::Terminated => SyncError::Terminated,
            other if other.is_fatal() => SyncError::Fatal(other.to_string()),
            other => SyncError::transport_fatal(other.to_string()),
        }
    }
}

impl From<Status> for SyncError {
    fn from(status: Status) -> Self {
        SyncError::Backend(status)
    }
}
