//! Common error types for raidstore.

use thiserror::Error;

/// Top-level error type for registry storage operations.
///
/// `NotFound` and `AlreadyExists` are contract outcomes and are always
/// surfaced to the caller unchanged. Everything else describes a failure of
/// the underlying medium and carries diagnostic text for logging only.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Version mismatch on write. Reserved for optimistic locking.
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Access denied. Reserved for the policy layer.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A transaction lost a race against a concurrent writer.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller's deadline elapsed before the medium answered.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Coarse classification used by outer layers to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidVersion,
    AccessDenied,
    /// Unclassified medium or input failure.
    Other,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidVersion(_) => ErrorKind::InvalidVersion,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            _ => ErrorKind::Other,
        }
    }

    /// Whether this is a transaction conflict that may succeed on re-run.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
