//! Request and result types shared by the router, the merge coordinator and
//! the servant facade.
//!
//! Cell values are transported as strings. SQL `NULL` is `None`, which stays
//! distinct from the empty string `Some("")`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Leading keyword that marks a statement as a read. Matched case-sensitively.
pub const SELECT_KEYWORD: &str = "SELECT";

/// Rendering used for `NULL` cells in logs and the CLI
pub const NULL_SENTINEL: &str = "NULL";

/// A single cell; `None` is SQL `NULL`
pub type Cell = Option<String>;

/// Read or write, decided by the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// Returns a row set
    Read,
    /// Returns rows-affected / last-insert-id
    Write,
}

impl StatementKind {
    /// Classify a statement.
    ///
    /// Only a statement whose very first characters are an upper-case
    /// `SELECT` counts as a read; `select ...` and `  SELECT ...` are
    /// executed as writes.
    pub fn classify(sql: &str) -> Self {
        if sql.starts_with(SELECT_KEYWORD) {
            Self::Read
        } else {
            Self::Write
        }
    }

    /// Short operation label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "qry",
            Self::Write => "exc",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rows materialized by a backend connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    /// Column names in select order
    pub columns: Vec<String>,
    /// Rows, each with one cell per column
    pub rows: Vec<Vec<Cell>>,
}

impl RowSet {
    /// Create a row set
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }
}

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Rows changed by the statement
    pub rows_affected: u64,
    /// Auto-increment id generated by the statement, 0 when none
    pub last_insert_id: u64,
}

/// Transport-neutral result of `Servant::query`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names (reads only)
    pub columns: Vec<String>,
    /// Rows (reads only)
    pub rows: Vec<Vec<Cell>>,
    /// Rows affected (writes only)
    pub rows_affected: u64,
    /// Last insert id (writes only)
    pub last_insert_id: u64,
}

impl QueryResult {
    /// Result of a read
    pub fn from_rows(set: RowSet) -> Self {
        Self {
            columns: set.columns,
            rows: set.rows,
            ..Default::default()
        }
    }

    /// Result of a write
    pub fn from_exec(outcome: ExecOutcome) -> Self {
        Self {
            rows_affected: outcome.rows_affected,
            last_insert_id: outcome.last_insert_id,
            ..Default::default()
        }
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows with `NULL` rendered as [`NULL_SENTINEL`]
    pub fn display_rows(&self) -> Vec<Vec<&str>> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.as_deref().unwrap_or(NULL_SENTINEL))
                    .collect()
            })
            .collect()
    }
}

/// Per-call context carried across the RPC boundary
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Caller-supplied request id
    pub request_id: String,
    /// Calling host or service
    pub caller: String,
    /// Absolute deadline for the whole call
    pub deadline: Option<Instant>,
}

impl CallContext {
    /// Context with a request id
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// Set the caller
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{rid:{} caller:{}}}", self.request_id, self.caller)
    }
}

/// A routed statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Logical pool
    pub pool: String,
    /// Table the statement targets
    pub table: String,
    /// Routing hint
    pub hint: i64,
    /// Statement text
    pub sql: String,
    /// Positional parameters
    pub args: Vec<String>,
    /// Lookup predicate used as cache key; `None` bypasses the cache
    pub cache_predicate: Option<String>,
}

impl QueryRequest {
    /// Create a request
    pub fn new(
        pool: impl Into<String>,
        table: impl Into<String>,
        hint: i64,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            pool: pool.into(),
            table: table.into(),
            hint,
            sql: sql.into(),
            args: Vec::new(),
            cache_predicate: None,
        }
    }

    /// Set positional parameters
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Read through / invalidate the cache entry of this predicate
    pub fn with_cache_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.cache_predicate = Some(predicate.into());
        self
    }

    /// Read or write
    pub fn kind(&self) -> StatementKind {
        StatementKind::classify(&self.sql)
    }
}

/// A JSON column merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Logical pool
    pub pool: String,
    /// Table holding the JSON column
    pub table: String,
    /// Routing hint, shared by the read and the write
    pub hint: i64,
    /// `WHERE` clause selecting exactly one row
    pub predicate: String,
    /// Scope of the single-writer guarantee
    pub key: String,
    /// JSON column
    pub column: String,
    /// JSON object merged into the stored value
    pub patch: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_is_case_sensitive() {
        assert_eq!(StatementKind::classify("SELECT 1"), StatementKind::Read);
        assert_eq!(StatementKind::classify("  SELECT * FROM t"), StatementKind::Write);
        assert_eq!(StatementKind::classify("select * from t"), StatementKind::Write);
        assert_eq!(StatementKind::classify("UPDATE t SET a=1"), StatementKind::Write);
        assert_eq!(StatementKind::classify("INSERT INTO t VALUES (1)"), StatementKind::Write);
    }

    #[test]
    fn test_null_is_distinct_from_empty() {
        let result = QueryResult::from_rows(RowSet::new(
            vec!["a".into(), "b".into()],
            vec![vec![None, Some(String::new())]],
        ));
        assert_ne!(result.rows[0][0], result.rows[0][1]);
        assert_eq!(result.display_rows(), vec![vec!["NULL", ""]]);

        let json = serde_json::to_string(&result).unwrap();
        let back: QueryResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rows[0][0], None);
        assert_eq!(back.rows[0][1], Some(String::new()));
    }

    #[test]
    fn test_exec_result_has_no_rows() {
        let result = QueryResult::from_exec(ExecOutcome {
            rows_affected: 3,
            last_insert_id: 42,
        });
        assert!(result.rows.is_empty());
        assert!(result.columns.is_empty());
        assert_eq!(result.rows_affected, 3);
        assert_eq!(result.last_insert_id, 42);
    }

    #[test]
    fn test_request_builders() {
        let req = QueryRequest::new("UserShard", "UserInfo", 7, "SELECT * FROM UserInfo WHERE uid=?")
            .with_args(vec!["7".into()])
            .with_cache_predicate("uid=7");
        assert_eq!(req.kind(), StatementKind::Read);
        assert_eq!(req.cache_predicate.as_deref(), Some("uid=7"));

        let ctx = CallContext::new("r-1").with_caller("web01");
        assert_eq!(ctx.to_string(), "{rid:r-1 caller:web01}");
    }
}
