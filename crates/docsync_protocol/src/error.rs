//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while reading protocol values out of documents.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A version stamp field exists but does not have the expected shape.
    #[error("invalid version stamp: {0}")]
    InvalidVersion(String),

    /// A document is missing its `_id` field.
    #[error("document has no _id")]
    MissingId,

    /// A value could not be converted to or from a document.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A value was expected to serialize to a JSON object.
    #[error("expected a document, found {0}")]
    NotADocument(String),
}
