//! Query parser error
//!
//! The only error in the engine that is raised out-of-band: the parser
//! fails fast on the first malformed field. It is caught at the pipeline
//! boundary and converted to `StorageError::QueryParse`, so callers only
//! ever see status values.

use crate::storage::error::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    /// Malformed or unknown query field; the location names the
    /// offending key.
    #[error("at '{location}': {message}")]
    Parse { location: String, message: String },

    /// Query references a series or metric the registry has never seen.
    #[error("no series match '{0}'")]
    NoMatch(String),
}

impl QueryError {
    pub fn at(location: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::Parse {
            location: location.into(),
            message: message.into(),
        }
    }
}

impl From<QueryError> for StorageError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::NoMatch(what) => StorageError::NotFound(what),
            other => StorageError::QueryParse(other.to_string()),
        }
    }
}

/// Result type alias for the query layer
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_names_location() {
        let err = QueryError::at("order-by", "expected 'time' or 'series'");
        assert_eq!(err.to_string(), "at 'order-by': expected 'time' or 'series'");
    }

    #[test]
    fn test_conversion_to_status() {
        let err: StorageError = QueryError::at("select", "missing").into();
        assert!(matches!(err, StorageError::QueryParse(_)));

        let err: StorageError = QueryError::NoMatch("cpu".into()).into();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
