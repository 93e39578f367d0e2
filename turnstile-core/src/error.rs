use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Locked out, retry after {}s", retry_after.as_secs())]
    LockedOut { retry_after: Duration },

    #[error("Attempt window exhausted, retry after {}s", retry_after.as_secs())]
    WindowExhausted { retry_after: Duration },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Metrics error: {0}")]
    Metrics(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Script execution failed: {0}")]
    Script(String),

    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Backend lock poisoned")]
    Poisoned,
}

/// Semantic classification of an [`Error`].
///
/// Callers that translate limiter outcomes into transport responses (HTTP 429,
/// 503, ...) should match on this rather than on the concrete variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    LockedOut,
    WindowExhausted,
    BackendUnavailable,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::Metrics(_) => ErrorKind::InvalidArgument,
            Error::LockedOut { .. } => ErrorKind::LockedOut,
            Error::WindowExhausted { .. } => ErrorKind::WindowExhausted,
            Error::Backend(_) => ErrorKind::BackendUnavailable,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
        }
    }

    /// `true` for the denial outcomes that carry a `retry_after`.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::LockedOut { .. } | Error::WindowExhausted { .. })
    }

    pub fn is_backend_error(&self) -> bool {
        matches!(self, Error::Backend(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// How long the caller should wait before retrying, for rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::LockedOut { retry_after } | Error::WindowExhausted { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
    Error::InvalidArgument(message.into())
}
