//! Error types for rivven-servant
//!
//! Errors are classified so that callers can tell apart:
//! - "retry elsewhere" (breaker open, pool exhausted, merge lock contention)
//! - "request is invalid" (unknown pool, rejected statement, malformed JSON)
//! - "data inconsistency" (merge precondition violated)

use std::fmt;
use thiserror::Error;

/// Result type for rivven-servant operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The target is shedding load; retry later or elsewhere
    RetryElsewhere,
    /// Transport-level failure or timeout (retriable)
    Transient,
    /// The request itself cannot succeed as issued
    InvalidRequest,
    /// Stored data violates an operation precondition
    DataInconsistency,
    /// Configuration rejected at load/reload time
    Configuration,
    /// Internal errors
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::RetryElsewhere | Self::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryElsewhere => write!(f, "retry_elsewhere"),
            Self::Transient => write!(f, "transient"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::DataInconsistency => write!(f, "data_inconsistency"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Shard routing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Pool is not part of the active topology
    #[error("unknown pool '{pool}'")]
    UnknownPool { pool: String },

    /// Computed shard index has no configured server
    #[error("shard index {index} out of range for pool '{pool}' ({servers} servers)")]
    IndexOutOfRange {
        pool: String,
        index: u64,
        servers: usize,
    },
}

/// Connection pool failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No connection became available within the connect timeout
    #[error("timed out after {waited_ms}ms waiting for a connection to {server}")]
    Timeout { server: String, waited_ms: u64 },

    /// Pool cannot hand out connections (retired or closed)
    #[error("pool for {server} exhausted: {message}")]
    Exhausted { server: String, message: String },
}

/// Main error type for rivven-servant
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Routing failed
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Connection pool failed
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Circuit breaker for the server is open
    #[error("circuit breaker open for {server}")]
    BreakerOpen { server: String },

    /// Connecting to, or talking to, the server failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server rejected the statement
    #[error("query error: {message}")]
    Query { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Statement execution failed; carries the routing context
    #[error("statement failed on {pool}[{table}] sql={sql}: {source}")]
    Statement {
        pool: String,
        table: String,
        sql: String,
        #[source]
        source: Box<Error>,
    },

    /// Merge read did not return exactly one row
    #[error("invalid row count: expected {expected}, got {actual}")]
    InvalidRowCount { expected: usize, actual: usize },

    /// Table or column name rejected before it reaches SQL text
    #[error("invalid SQL identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// Malformed JSON in a stored or patch value
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Waiting for the merge key lock took too long
    #[error("timed out waiting for merge lock on key '{key}'")]
    MergeLockTimeout { key: String },

    /// Too many distinct merge keys outstanding
    #[error("merge lock registry full ({limit} outstanding keys)")]
    MergeLockExhausted { limit: usize },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Cache store error (absorbed by the cache-aside layer)
    #[error("cache error: {message}")]
    Cache { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Routing(_) => ErrorCategory::InvalidRequest,
            Self::Pool(_) | Self::BreakerOpen { .. } => ErrorCategory::RetryElsewhere,
            Self::MergeLockTimeout { .. } | Self::MergeLockExhausted { .. } => {
                ErrorCategory::RetryElsewhere
            }
            Self::Connection { .. } | Self::Timeout { .. } => ErrorCategory::Transient,
            Self::Query { .. } | Self::Serialization { .. } | Self::InvalidIdentifier { .. } => {
                ErrorCategory::InvalidRequest
            }
            Self::Statement { source, .. } => source.category(),
            Self::InvalidRowCount { .. } => ErrorCategory::DataInconsistency,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Cache { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether the failure points at the server rather than the request.
    ///
    /// Only these outcomes count against a circuit breaker.
    pub fn is_server_fault(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Statement { source, .. } => source.is_server_fault(),
            _ => false,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a cache error
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Wrap a backend error with the routing context it happened in
    pub fn statement(
        pool: impl Into<String>,
        table: impl Into<String>,
        sql: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::Statement {
            pool: pool.into(),
            table: table.into(),
            sql: sql.into(),
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::RetryElsewhere.is_retriable());
        assert!(ErrorCategory::Transient.is_retriable());

        assert!(!ErrorCategory::InvalidRequest.is_retriable());
        assert!(!ErrorCategory::DataInconsistency.is_retriable());
        assert!(!ErrorCategory::Configuration.is_retriable());
    }

    #[test]
    fn test_caller_facing_classification() {
        let open = Error::BreakerOpen {
            server: "db1:3306".into(),
        };
        assert_eq!(open.category(), ErrorCategory::RetryElsewhere);

        let exhausted: Error = PoolError::Exhausted {
            server: "db1:3306".into(),
            message: "retired".into(),
        }
        .into();
        assert_eq!(exhausted.category(), ErrorCategory::RetryElsewhere);

        let unknown: Error = RoutingError::UnknownPool {
            pool: "nope".into(),
        }
        .into();
        assert_eq!(unknown.category(), ErrorCategory::InvalidRequest);
        assert!(!unknown.is_retriable());

        let rows = Error::InvalidRowCount {
            expected: 1,
            actual: 0,
        };
        assert_eq!(rows.category(), ErrorCategory::DataInconsistency);
    }

    #[test]
    fn test_statement_delegates_to_source() {
        let err = Error::statement("UserShard", "UserInfo", "SELECT 1", Error::connection("reset"));
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_server_fault());

        let err = Error::statement("UserShard", "UserInfo", "SELEC 1", Error::query("syntax"));
        assert_eq!(err.category(), ErrorCategory::InvalidRequest);
        assert!(!err.is_server_fault());
    }

    #[test]
    fn test_error_display() {
        let err = Error::statement(
            "UserShard",
            "UserInfo",
            "SELECT * FORM UserInfo",
            Error::query("syntax error"),
        );
        let text = err.to_string();
        assert!(text.contains("UserShard[UserInfo]"));
        assert!(text.contains("syntax error"));

        let err: Error = RoutingError::IndexOutOfRange {
            pool: "UserShard".into(),
            index: 7,
            servers: 4,
        }
        .into();
        assert!(err.to_string().contains("shard index 7"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
