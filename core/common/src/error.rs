//! Common error types for Mailsync.

use thiserror::Error;

/// Top-level error type for Mailsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network or HTTP transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// A structurally valid response violated a domain invariant.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Durable store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials were rejected by the remote.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The worker was cleaned up before the operation finished.
    #[error("Terminated")]
    Terminated,
}

impl Error {
    /// Whether the error is recovered by backing off and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Validation(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
