//! # rivven-servant
//!
//! Sharded MySQL data-access servant.
//!
//! Callers address data by logical pool, table and an integer routing hint;
//! the servant resolves the physical server, executes the statement on a
//! pooled connection guarded by that server's circuit breaker, and returns
//! rows (for `SELECT`) or rows-affected / last-insert-id (for writes).
//!
//! ## Features
//!
//! - **Shard Routing**: global pools and `hint mod shard_base` (or murmur2) sharding
//! - **Connection Pooling**: per-server pools with idle caps, open caps and heartbeats
//! - **Circuit Breaking**: per-server sliding-window breaker with a single half-open trial
//! - **Cache-Aside Reads**: in-process LRU or redis, keyed by pool, table and predicate
//! - **JSON Merge**: per-key serialized read-merge-write of JSON columns
//! - **Hot Reconfiguration**: atomic context swap that rebuilds only what changed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_servant::prelude::*;
//!
//! let config = ServantConfig::from_file("servant.yaml")?;
//! let servant = Servant::new(config, Arc::new(MySqlConnectionFactory))?;
//!
//! let ctx = CallContext::new("req-1").with_caller("profile-svc");
//! let result = servant
//!     .query(&ctx, &QueryRequest::new("UserShard", "UserInfo", 42, "SELECT name FROM UserInfo WHERE uid=42"))
//!     .await?;
//!
//! servant
//!     .merge(&ctx, &MergeRequest {
//!         pool: "UserShard".into(),
//!         table: "UserInfo".into(),
//!         hint: 42,
//!         predicate: "uid=42".into(),
//!         key: "user:42".into(),
//!         column: "profile".into(),
//!         patch: r#"{"theme":"dark"}"#.into(),
//!     })
//!     .await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `mysql` - MySQL backend via mysql_async
//! - `redis` - redis cache store

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod breaker;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod servant;
pub mod server;
pub mod topology;
pub mod types;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, PoolError, Result, RoutingError};

    pub use crate::config::{
        BreakerConfig, CacheConfig, CacheStoreKind, ConfigDiff, MergeConfig, MysqlConfig,
        PoolSpec, ServantConfig, ServerConfig,
    };

    pub use crate::types::{
        CallContext, Cell, ExecOutcome, MergeRequest, QueryRequest, QueryResult, RowSet,
        StatementKind,
    };

    pub use crate::connection::{Connection, ConnectionFactory};
    pub use crate::server::ServerDescriptor;
    pub use crate::topology::{HashStrategy, ShardStrategy, ShardTopology, StandardStrategy};

    pub use crate::breaker::{BreakerPermit, CircuitBreaker, CircuitState};
    pub use crate::pool::{PoolSet, PoolStats, PooledConnection, ServerPool};

    pub use crate::cache::{CacheAside, CacheStore, MemStore};
    pub use crate::merge::{deep_merge, MergeCoordinator, MergeKeyLocks};
    pub use crate::router::Router;

    pub use crate::cluster::{ClusterContext, ReloadReport};
    pub use crate::metrics::{CallCounters, CallCountersSnapshot, ServantMetrics};
    pub use crate::servant::{RuntimeSnapshot, Servant, WarmUpOutcome};

    #[cfg(feature = "mysql")]
    pub use crate::mysql::{MySqlConnection, MySqlConnectionFactory};
}

pub use error::{Error, Result};
pub use servant::Servant;
