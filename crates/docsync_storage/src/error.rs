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

    /// A document with the same `_id` already exists.
    #[error("duplicate key {id} in collection {collection}")]
    DuplicateKey {
        /// Collection name.
        collection: String,
        /// Rendered id of the conflicting document.
        id: String,
    },

    /// A document cannot be stored as given.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A collection snapshot could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Another process holds the store directory.
    #[error("store directory is locked by another process")]
    Locked,
}

impl StorageError {
    /// Returns true for duplicate-key failures.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StorageError::DuplicateKey { .. })
    }
}
