//! Connection traits for rivven-servant
//!
//! The database driver is consumed through two seams:
//! - [`Connection`]: one live session able to run reads and writes
//! - [`ConnectionFactory`]: dials a session for a [`ServerDescriptor`]
//!
//! The MySQL implementation lives in [`crate::mysql`]; tests plug in an
//! in-memory backend.

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;
use crate::server::ServerDescriptor;
use crate::types::{ExecOutcome, RowSet};

/// A connection to a database server
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that returns rows
    async fn query(&self, sql: &str, params: &[String]) -> Result<RowSet>;

    /// Execute a statement that modifies data
    async fn execute(&self, sql: &str, params: &[String]) -> Result<ExecOutcome>;

    /// Round-trip a no-op to verify the session is alive
    async fn ping(&self) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Dial a new session to `server`
    async fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn Connection>>;

    /// Backend name, used in logs
    fn backend(&self) -> &'static str;
}

impl fmt::Debug for dyn ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("backend", &self.backend())
            .finish()
    }
}
