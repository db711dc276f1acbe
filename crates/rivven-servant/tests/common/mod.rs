//! In-memory backend shared by the integration tests
//!
//! Understands just enough SQL to back routing, cache and merge tests:
//!
//! - `SELECT col FROM table WHERE pred` reads the stored cell for `(host, table, pred)`
//! - `UPDATE table SET col=? WHERE pred` stores `args[0]` for `(host, table, pred)`
//! - any other `SELECT` returns one row `[host]` in column `server`
//! - any other write affects one row and gets a fresh insert id

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rivven_servant::prelude::*;

type RowKey = (String, String, String);

/// Shared state behind every [`FakeConnection`]
#[derive(Debug, Default)]
pub struct FakeBackend {
    cells: DashMap<RowKey, Option<String>>,
    failing: DashSet<String>,
    read_delay_ms: AtomicU64,
    next_insert_id: AtomicU64,
    /// Successful dials
    pub connects: AtomicUsize,
    /// Statements that reached a server, per host
    pub statements: DashMap<String, usize>,
    /// Executed writes, in order
    pub writes: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a cell read by `SELECT <any column> FROM table WHERE predicate`
    pub fn put(&self, host: &str, table: &str, predicate: &str, value: Option<&str>) {
        self.cells.insert(
            (host.to_string(), table.to_string(), predicate.to_string()),
            value.map(str::to_string),
        );
    }

    pub fn get(&self, host: &str, table: &str, predicate: &str) -> Option<Option<String>> {
        self.cells
            .get(&(host.to_string(), table.to_string(), predicate.to_string()))
            .map(|cell| cell.value().clone())
    }

    /// Make every dial and statement against `host` fail
    pub fn fail_host(&self, host: &str) {
        self.failing.insert(host.to_string());
    }

    pub fn heal_host(&self, host: &str) {
        self.failing.remove(host);
    }

    /// Delay applied to every read
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn statements_on(&self, host: &str) -> usize {
        self.statements.get(host).map(|n| *n).unwrap_or(0)
    }

    pub fn total_statements(&self) -> usize {
        self.statements.iter().map(|entry| *entry.value()).sum()
    }

    fn check_host(&self, host: &str) -> Result<()> {
        if self.failing.contains(host) {
            return Err(Error::connection(format!("{} unreachable", host)));
        }
        Ok(())
    }

    fn count(&self, host: &str) {
        *self.statements.entry(host.to_string()).or_insert(0) += 1;
    }
}

/// Factory handing out [`FakeConnection`]s bound to the dialled host
#[derive(Debug, Clone)]
pub struct FakeFactory {
    pub backend: Arc<FakeBackend>,
}

impl FakeFactory {
    pub fn new(backend: &Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::clone(backend),
        })
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn Connection>> {
        self.backend.check_host(server.host())?;
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            host: server.host().to_string(),
            backend: Arc::clone(&self.backend),
        }))
    }

    fn backend(&self) -> &'static str {
        "fake"
    }
}

pub struct FakeConnection {
    host: String,
    backend: Arc<FakeBackend>,
}

/// `SELECT col FROM table WHERE pred` -> `(col, table, pred)`
fn parse_select(sql: &str) -> Option<(&str, &str, &str)> {
    let rest = sql.trim().strip_prefix("SELECT ")?;
    let (column, rest) = rest.split_once(" FROM ")?;
    let (table, predicate) = rest.split_once(" WHERE ")?;
    Some((column.trim(), table.trim(), predicate.trim()))
}

/// `UPDATE table SET col=? WHERE pred` -> `(table, pred)`
fn parse_update(sql: &str) -> Option<(&str, &str)> {
    let rest = sql.trim().strip_prefix("UPDATE ")?;
    let (table, rest) = rest.split_once(" SET ")?;
    let (_, predicate) = rest.split_once(" WHERE ")?;
    Some((table.trim(), predicate.trim()))
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&self, sql: &str, _params: &[String]) -> Result<RowSet> {
        self.backend.check_host(&self.host)?;
        self.backend.count(&self.host);

        let delay = self.backend.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match parse_select(sql) {
            Some((column, table, predicate)) => {
                let rows = match self.backend.get(&self.host, table, predicate) {
                    Some(cell) => vec![vec![cell]],
                    None => Vec::new(),
                };
                Ok(RowSet::new(vec![column.to_string()], rows))
            }
            None => Ok(RowSet::new(
                vec!["server".to_string()],
                vec![vec![Some(self.host.clone())]],
            )),
        }
    }

    async fn execute(&self, sql: &str, params: &[String]) -> Result<ExecOutcome> {
        self.backend.check_host(&self.host)?;
        self.backend.count(&self.host);
        self.backend
            .writes
            .lock()
            .push((self.host.clone(), sql.to_string(), params.to_vec()));

        if let Some((table, predicate)) = parse_update(sql) {
            let existed = self.backend.get(&self.host, table, predicate).is_some();
            if existed {
                self.backend
                    .put(&self.host, table, predicate, params.first().map(String::as_str));
            }
            return Ok(ExecOutcome {
                rows_affected: u64::from(existed),
                last_insert_id: 0,
            });
        }

        Ok(ExecOutcome {
            rows_affected: 1,
            last_insert_id: self.backend.next_insert_id.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.backend.check_host(&self.host)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Configuration with one global pool (`ShardLookup` on `lookup`) and a
/// sharded pool `UserShard` over `hosts`
pub fn config_for(hosts: &[&str]) -> ServantConfig {
    let mut yaml = format!(
        r#"
slow_call_threshold: 10s
mysql:
  shard_base_num: {}
  global_pools: [ShardLookup]
  connect_timeout: 500ms
  io_timeout: 2s
  max_idle_conns_per_server: 2
  max_conns_per_server: 8
  heartbeat_interval: 1h
  cache:
    store: mem
    mem_max_items: 1000
  breaker:
    failure_rate_threshold: 0.5
    min_calls: 4
    window: 30s
    cooldown: 200ms
  merge:
    max_outstanding_keys: 64
    lock_timeout: 5s
  servers:
    - pool: ShardLookup
      host: lookup
      db: lookup
"#,
        hosts.len()
    );
    for (index, host) in hosts.iter().enumerate() {
        yaml.push_str(&format!(
            "    - pool: UserShard\n      host: {}\n      db: user_{}\n",
            host, index
        ));
    }
    ServantConfig::from_yaml(&yaml).expect("test config must parse")
}

/// Servant over `hosts` backed by `backend`
pub fn servant(backend: &Arc<FakeBackend>, hosts: &[&str]) -> Arc<Servant> {
    Servant::new(config_for(hosts), FakeFactory::new(backend)).expect("servant must start")
}

pub fn ctx(id: &str) -> CallContext {
    CallContext::new(id).with_caller("tests")
}

/// `SELECT` reporting which host served it
pub fn which_server(hint: i64) -> QueryRequest {
    QueryRequest::new("UserShard", "UserInfo", hint, "SELECT @@hostname")
}

pub fn served_by(result: &QueryResult) -> String {
    result.rows[0][0].clone().unwrap_or_default()
}

pub fn merge_request(hint: i64, uid: i64, patch: &str) -> MergeRequest {
    MergeRequest {
        pool: "UserShard".to_string(),
        table: "UserInfo".to_string(),
        hint,
        predicate: format!("uid={}", uid),
        key: format!("user:{}", uid),
        column: "profile".to_string(),
        patch: patch.to_string(),
    }
}
