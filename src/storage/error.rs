//! Engine error types
//!
//! Errors are values everywhere: the only module that raises out-of-band
//! is the query parser, and its error is converted to `QueryParse` at the
//! pipeline boundary.

use thiserror::Error;

/// Errors that can occur anywhere in the engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested series, column, or database object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed series name, query shape, or argument
    #[error("bad input: {0}")]
    BadInput(String),

    /// Input log backpressure; retry with backoff
    #[error("input log buffers full")]
    Overflow,

    /// Storage has been closed; no further operations are permitted
    #[error("storage is closed")]
    Closed,

    /// Operation refused (e.g. removing a non-empty database without force)
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Insufficient privileges for a filesystem operation
    #[error("access denied: {0}")]
    Access(String),

    /// Query text failed to parse
    #[error("query parser error: {0}")]
    QueryParse(String),

    /// Serialization failure or checksum mismatch
    #[error("corrupt data: {0}")]
    Corruption(String),

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Corruption(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::QueryParse(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Internal(format!("metadata store: {}", err))
    }
}

impl StorageError {
    /// Errors are not `Clone` because of the wrapped `io::Error`; fan-out
    /// paths (cursor + log) get a copy preserving kind and message.
    pub fn duplicate(&self) -> StorageError {
        match self {
            StorageError::Io(e) => StorageError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StorageError::NotFound(s) => StorageError::NotFound(s.clone()),
            StorageError::BadInput(s) => StorageError::BadInput(s.clone()),
            StorageError::Overflow => StorageError::Overflow,
            StorageError::Closed => StorageError::Closed,
            StorageError::NotPermitted(s) => StorageError::NotPermitted(s.clone()),
            StorageError::Access(s) => StorageError::Access(s.clone()),
            StorageError::QueryParse(s) => StorageError::QueryParse(s.clone()),
            StorageError::Corruption(s) => StorageError::Corruption(s.clone()),
            StorageError::Internal(s) => StorageError::Internal(s.clone()),
        }
    }
}

/// Result type alias for engine operations
pub type StorageResult<T> = Result<T, StorageError>;
