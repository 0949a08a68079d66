use std::time::Duration;
use thiserror::Error;

/// Failures that abort a query group (or a connection target) for one scrape.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The DSN is neither a `postgres://` URL nor a `key=value` string.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("query {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("query {name} failed: {source}")]
    Execution {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Driver failure outside of a query group (ping, server info, ...).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no database connection")]
    NotConnected,
}

impl QueryError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A value that could not be turned into a label or a sample. Never fatal:
/// these travel next to the metrics that were produced.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RowConversionError {
    #[error("{query}: cannot render column {column} ({kind}) as a label, row skipped")]
    Label {
        query: String,
        column: String,
        kind: &'static str,
    },

    #[error("{query}: unexpected value {value} in column {column}")]
    Value {
        query: String,
        column: String,
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = QueryError::Timeout {
            name: "pg_lock".to_string(),
            timeout: Duration::from_millis(100),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "query pg_lock timed out after 100ms");
    }

    #[test]
    fn test_execution_keeps_source() {
        let err = QueryError::Execution {
            name: "pg_lock".to_string(),
            source: sqlx::Error::Protocol("connection refused".to_string()),
        };
        assert!(!err.is_timeout());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_value_error_display() {
        let err = RowConversionError::Value {
            query: "pg_lock".to_string(),
            column: "count".to_string(),
            value: "\"abc\"".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "pg_lock: unexpected value \"abc\" in column count"
        );
    }
}
