//! Error types for the store and sync layer.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur talking to the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Document does not exist.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// A transaction precondition did not hold; nothing was written.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Document could not be converted to or from a record.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Document is structurally invalid (not an object, bad bookkeeping fields).
    #[error("malformed document: {0}")]
    Malformed(String),

    /// Store unreachable or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store has been shut down.
    #[error("store closed")]
    Closed,
}
