//! Error types for the COE reconciler
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for COE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the COE reconciler
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or incomplete orchestration input for a single endpoint
    #[error("Translation failed for {endpoint}: {reason}")]
    Translation {
        /// Endpoint identity (`kind/namespace/name`)
        endpoint: String,
        /// Why the endpoint could not be translated
        reason: String,
    },

    /// Concurrent write race detected by datastore versioning
    #[error("Write conflict on {path}: {reason}")]
    Conflict {
        /// Datastore path that failed its precondition
        path: String,
        /// Conflict details
        reason: String,
    },

    /// Network or datastore temporarily unreachable
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Unrecoverable configuration problem
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    /// `start()` was called on a running service
    #[error("Service already started")]
    AlreadyStarted,

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Datastore errors that retrying will not fix
    #[error("Datastore error: {0}")]
    Datastore(String),

    /// Orchestration event source errors
    #[error("Event source error: {0}")]
    EventSource(String),

    /// Checkpoint store errors
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(String),

    /// HTTP client errors (from datastore or source backends)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a translation error
    pub fn translation(endpoint: impl ToString, reason: impl Into<String>) -> Self {
        Self::Translation {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a write conflict error
    pub fn conflict(path: impl ToString, reason: impl Into<String>) -> Self {
        Self::Conflict {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a transient I/O error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a fatal configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::FatalConfig(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a datastore error
    pub fn datastore(msg: impl Into<String>) -> Self {
        Self::Datastore(msg.into())
    }

    /// Create an event source error
    pub fn event_source(msg: impl Into<String>) -> Self {
        Self::EventSource(msg.into())
    }

    /// Create a checkpoint store error
    pub fn checkpoint_store(msg: impl Into<String>) -> Self {
        Self::CheckpointStore(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Whether the engine should retry the failed operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::TransientIo(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::conflict("coe/bindings/pod/a/w1", "version 3 != 4").is_retryable());
        assert!(Error::transient("connection reset").is_retryable());
        assert!(!Error::translation("pod/a/w1", "bad mac").is_retryable());
        assert!(!Error::config("max_attempts must be > 0").is_retryable());
        assert!(!Error::AlreadyStarted.is_retryable());
    }
}
