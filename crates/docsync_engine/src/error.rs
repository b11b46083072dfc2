//! Error types for the sync engine.

use docsync_protocol::ProtocolError;
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Malformed protocol value.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Remote store or change stream error.
    #[error("remote error: {message}")]
    Remote {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote store already holds a document with this id.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The remote store is unreachable or the user is logged out.
    #[error("not connected to remote")]
    NotConnected,

    /// A persisted record or remote value could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A remote document carries a version stamp layout we do not speak.
    #[error("unsupported sync protocol version {0}")]
    UnsupportedProtocolVersion(i32),

    /// A change event refers to a document that should exist locally.
    #[error("document does not exist: {0}")]
    DocumentDoesNotExist(String),

    /// A conflict handler failed.
    #[error("conflict resolution failed: {0}")]
    Resolution(String),

    /// An error that cannot be attributed to a document.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Typed payload conversion failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a retryable remote error.
    pub fn remote_retryable(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable remote error.
    pub fn remote_fatal(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            _ => false,
        }
    }
}
