//! Servant configuration
//!
//! Configuration is loaded from YAML with `${VAR}` / `${VAR:-default}`
//! environment expansion and validated before use. Every section is a plain
//! value object; hot reconfiguration compares sections with `PartialEq`
//! (see [`ConfigDiff`]) to decide which subsystems must be rebuilt.
//!
//! ```yaml
//! mysql:
//!   shard_base_num: 4
//!   global_pools: [ShardLookup]
//!   max_idle_conns_per_server: 2
//!   max_conns_per_server: 10
//!   heartbeat_interval: 2m
//!   cache:
//!     store: mem
//!     mem_max_items: 100000
//!   servers:
//!     - pool: ShardLookup
//!       host: db-global
//!       db: lookup
//!     - pool: UserShard
//!       host: db-user-0
//!       db: user_0
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, Result};
use crate::merge::validate_identifier;
use crate::topology::strategy_for;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ServantConfig {
    /// Sharded MySQL settings
    #[serde(default)]
    #[validate(nested)]
    pub mysql: MysqlConfig,

    /// How often the call counters are written to the log
    #[serde(default = "default_stats_output_interval", with = "humantime_serde")]
    pub stats_output_interval: Duration,

    /// Calls slower than this are logged as slow
    #[serde(default = "default_slow_call_threshold", with = "humantime_serde")]
    pub slow_call_threshold: Duration,
}

impl Default for ServantConfig {
    fn default() -> Self {
        Self {
            mysql: MysqlConfig::default(),
            stats_output_interval: default_stats_output_interval(),
            slow_call_threshold: default_slow_call_threshold(),
        }
    }
}

fn default_stats_output_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_slow_call_threshold() -> Duration {
    Duration::from_secs(1)
}

impl ServantConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field invariants
    pub fn check(&self) -> Result<()> {
        Validate::validate(self).map_err(|e| Error::config(e.to_string()))?;
        self.mysql.check()
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Sharded MySQL configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MysqlConfig {
    /// Shard modulus applied to routing hints
    #[serde(default = "default_shard_base_num")]
    #[validate(range(min = 1))]
    pub shard_base_num: u64,

    /// Shard strategy name (`standard` or `hash`)
    #[serde(default = "default_shard_strategy")]
    pub shard_strategy: String,

    /// Upper bound for obtaining a connection (slot wait and dial)
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for a single statement round-trip
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Pools that are not sharded
    #[serde(default)]
    pub global_pools: BTreeSet<String>,

    /// Idle connections kept per server
    #[serde(default = "default_max_idle_conns_per_server")]
    pub max_idle_conns_per_server: usize,

    /// Open connections allowed per server
    #[serde(default = "default_max_conns_per_server")]
    #[validate(range(min = 1))]
    pub max_conns_per_server: usize,

    /// Interval between idle connection probes
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Query result cache
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Per-server circuit breaker
    #[serde(default)]
    #[validate(nested)]
    pub breaker: BreakerConfig,

    /// JSON merge coordination
    #[serde(default)]
    #[validate(nested)]
    pub merge: MergeConfig,

    /// Physical servers, grouped into pools by their `pool` field
    #[serde(default)]
    #[validate(nested)]
    pub servers: Vec<ServerConfig>,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            shard_base_num: default_shard_base_num(),
            shard_strategy: default_shard_strategy(),
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
            global_pools: BTreeSet::new(),
            max_idle_conns_per_server: default_max_idle_conns_per_server(),
            max_conns_per_server: default_max_conns_per_server(),
            heartbeat_interval: default_heartbeat_interval(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            merge: MergeConfig::default(),
            servers: Vec::new(),
        }
    }
}

fn default_shard_base_num() -> u64 {
    100_000
}

fn default_shard_strategy() -> String {
    "standard".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(4)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_idle_conns_per_server() -> usize {
    2
}

fn default_max_conns_per_server() -> usize {
    10
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(120)
}

impl MysqlConfig {
    /// Whether any server is configured
    pub fn enabled(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Distinct pool names, sorted
    pub fn pools(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|s| s.pool.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Effective shard base of a server entry
    pub fn shard_base_of(&self, server: &ServerConfig) -> u64 {
        server.shard_base_num.unwrap_or(self.shard_base_num)
    }

    fn check(&self) -> Result<()> {
        strategy_for(&self.shard_strategy)?;

        if self.connect_timeout.is_zero() {
            return Err(Error::config("mysql.connect_timeout must be greater than zero"));
        }
        if self.io_timeout.is_zero() {
            return Err(Error::config("mysql.io_timeout must be greater than zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::config("mysql.heartbeat_interval must be greater than zero"));
        }
        if self.max_idle_conns_per_server > self.max_conns_per_server {
            return Err(Error::config(format!(
                "mysql.max_idle_conns_per_server ({}) exceeds max_conns_per_server ({})",
                self.max_idle_conns_per_server, self.max_conns_per_server
            )));
        }

        let mut bases: BTreeMap<&str, u64> = BTreeMap::new();
        for server in &self.servers {
            // Interpolated into `SET NAMES` when a connection is opened
            if !server.charset.is_empty() && validate_identifier(&server.charset).is_err() {
                return Err(Error::config(format!(
                    "server {}:{} has invalid charset '{}'",
                    server.host, server.port, server.charset
                )));
            }
            let base = self.shard_base_of(server);
            if base == 0 {
                return Err(Error::config(format!(
                    "server {}:{} in pool '{}' has shard_base_num 0",
                    server.host, server.port, server.pool
                )));
            }
            match bases.get(server.pool.as_str()) {
                Some(existing) if *existing != base => {
                    return Err(Error::config(format!(
                        "pool '{}' mixes shard bases {} and {}",
                        server.pool, existing, base
                    )));
                }
                Some(_) => {}
                None => {
                    bases.insert(&server.pool, base);
                }
            }
        }

        for pool in &self.global_pools {
            if !bases.contains_key(pool.as_str()) {
                return Err(Error::config(format!(
                    "global pool '{}' has no servers",
                    pool
                )));
            }
        }

        if self.cache.store == CacheStoreKind::Redis && self.cache.redis_ttl.as_secs() == 0 {
            return Err(Error::config("mysql.cache.redis_ttl must be at least one second"));
        }

        self.breaker.check()?;
        self.merge.check()
    }

    /// Settings that shape the shard topology
    pub fn topology_spec(&self) -> TopologySpec {
        TopologySpec {
            shard_base_num: self.shard_base_num,
            shard_strategy: self.shard_strategy.clone(),
            connect_timeout: self.connect_timeout,
            global_pools: self.global_pools.clone(),
            servers: self.servers.clone(),
        }
    }

    /// Settings every per-server pool is built with
    pub fn pool_spec(&self) -> PoolSpec {
        PoolSpec {
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            max_idle: self.max_idle_conns_per_server,
            max_open: self.max_conns_per_server,
            heartbeat_interval: self.heartbeat_interval,
            breaker: self.breaker.clone(),
        }
    }
}

/// One physical server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Logical pool this server belongs to
    #[validate(length(min = 1))]
    pub pool: String,

    /// Host name or address
    #[validate(length(min = 1))]
    pub host: String,

    /// TCP port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// User name
    #[serde(default)]
    pub username: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Schema (database) name
    #[validate(length(min = 1))]
    pub db: String,

    /// Connection character set
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Per-server shard base override
    #[serde(default)]
    pub shard_base_num: Option<u64>,
}

fn default_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8".to_string()
}

/// Cache store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStoreKind {
    /// In-process LRU
    #[default]
    Mem,
    /// Remote redis
    Redis,
}

impl std::fmt::Display for CacheStoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mem => write!(f, "mem"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

/// Query result cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    /// Backend
    #[serde(default)]
    pub store: CacheStoreKind,

    /// Capacity of the in-process LRU
    #[serde(default = "default_mem_max_items")]
    #[validate(range(min = 1))]
    pub mem_max_items: usize,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Expiry of redis entries
    #[serde(default = "default_redis_ttl", with = "humantime_serde")]
    pub redis_ttl: Duration,

    /// Upper bound for one redis round-trip
    #[serde(default = "default_redis_timeout", with = "humantime_serde")]
    pub redis_timeout: Duration,

    /// Hash the predicate part of cache keys
    #[serde(default = "default_key_hash")]
    pub key_hash: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store: CacheStoreKind::Mem,
            mem_max_items: default_mem_max_items(),
            redis_url: default_redis_url(),
            redis_ttl: default_redis_ttl(),
            redis_timeout: default_redis_timeout(),
            key_hash: default_key_hash(),
        }
    }
}

fn default_mem_max_items() -> usize {
    10 << 20
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_redis_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_key_hash() -> bool {
    true
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BreakerConfig {
    /// Failure ratio within the window that opens the breaker
    #[serde(default = "default_failure_rate_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_rate_threshold: f64,

    /// Outcomes required in the window before the ratio is evaluated
    #[serde(default = "default_min_calls")]
    #[validate(range(min = 1))]
    pub min_calls: u32,

    /// Sliding window length
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Time spent open before a trial call is allowed
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            min_calls: default_min_calls(),
            window: default_window(),
            cooldown: default_cooldown(),
        }
    }
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_min_calls() -> u32 {
    10
}

fn default_window() -> Duration {
    Duration::from_secs(10)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(10)
}

impl BreakerConfig {
    fn check(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(Error::config("mysql.breaker.window must be greater than zero"));
        }
        Ok(())
    }
}

/// JSON merge coordination configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct MergeConfig {
    /// Distinct merge keys that may be locked or awaited at once
    #[serde(default = "default_max_outstanding_keys")]
    #[validate(range(min = 1))]
    pub max_outstanding_keys: usize,

    /// Longest wait for a merge key lock
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_outstanding_keys: default_max_outstanding_keys(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

fn default_max_outstanding_keys() -> usize {
    10_000
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(5)
}

impl MergeConfig {
    fn check(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(Error::config("mysql.merge.lock_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Settings that determine the shard topology and server descriptors
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySpec {
    /// Default shard base
    pub shard_base_num: u64,
    /// Strategy name
    pub shard_strategy: String,
    /// Rendered into each descriptor's DSN
    pub connect_timeout: Duration,
    /// Unsharded pools
    pub global_pools: BTreeSet<String>,
    /// Server entries in configuration order
    pub servers: Vec<ServerConfig>,
}

/// Settings a per-server connection pool is built with
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSpec {
    /// Slot wait and dial bound
    pub connect_timeout: Duration,
    /// Statement round-trip bound
    pub io_timeout: Duration,
    /// Idle connections kept
    pub max_idle: usize,
    /// Open connections allowed
    pub max_open: usize,
    /// Idle probe interval
    pub heartbeat_interval: Duration,
    /// Breaker settings
    pub breaker: BreakerConfig,
}

impl Default for PoolSpec {
    fn default() -> Self {
        MysqlConfig::default().pool_spec()
    }
}

/// Which subsystems differ between two configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConfigDiff {
    /// Topology (servers, strategy, shard base, global pools)
    pub topology: bool,
    /// Pool sizing, timeouts, heartbeat or breaker settings
    pub pools: bool,
    /// Cache store selection or sizing
    pub cache: bool,
    /// Merge lock settings
    pub merge: bool,
    /// Reporting settings outside the mysql section
    pub reporting: bool,
}

impl ConfigDiff {
    /// Compare two configurations section by section
    pub fn between(old: &ServantConfig, new: &ServantConfig) -> Self {
        Self {
            topology: old.mysql.topology_spec() != new.mysql.topology_spec(),
            pools: old.mysql.pool_spec() != new.mysql.pool_spec(),
            cache: old.mysql.cache != new.mysql.cache,
            merge: old.mysql.merge != new.mysql.merge,
            reporting: old.stats_output_interval != new.stats_output_interval
                || old.slow_call_threshold != new.slow_call_threshold,
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        !(self.topology || self.pools || self.cache || self.merge || self.reporting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mysql:
  shard_base_num: 2
  global_pools: [ShardLookup]
  connect_timeout: 2s
  heartbeat_interval: 1m
  cache:
    store: mem
    mem_max_items: 128
  breaker:
    failure_rate_threshold: 0.6
    min_calls: 4
  servers:
    - pool: ShardLookup
      host: lookup.db
      db: lookup
    - pool: UserShard
      host: user0.db
      db: user_0
      username: app
      password: secret
    - pool: UserShard
      host: user1.db
      port: 3307
      db: user_1
"#;

    #[test]
    fn test_parse_sample() {
        let config = ServantConfig::from_yaml(SAMPLE).unwrap();
        let mysql = &config.mysql;

        assert_eq!(mysql.shard_base_num, 2);
        assert_eq!(mysql.shard_strategy, "standard");
        assert_eq!(mysql.connect_timeout, Duration::from_secs(2));
        assert_eq!(mysql.io_timeout, Duration::from_secs(30));
        assert_eq!(mysql.heartbeat_interval, Duration::from_secs(60));
        assert!(mysql.global_pools.contains("ShardLookup"));
        assert_eq!(mysql.cache.mem_max_items, 128);
        assert!(mysql.cache.key_hash);
        assert_eq!(mysql.breaker.min_calls, 4);
        assert_eq!(mysql.servers.len(), 3);
        assert_eq!(mysql.servers[0].port, 3306);
        assert_eq!(mysql.servers[0].charset, "utf8");
        assert_eq!(mysql.servers[2].port, 3307);
        assert_eq!(mysql.pools(), vec!["ShardLookup", "UserShard"]);
        assert!(mysql.enabled());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ServantConfig::from_file(file.path()).unwrap();
        assert_eq!(config, ServantConfig::from_yaml(SAMPLE).unwrap());

        let err = ServantConfig::from_file("/nonexistent/servant.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_redis_ttl_must_be_whole_seconds() {
        let yaml = "mysql:\n  cache:\n    store: redis\n    redis_ttl: 500ms\n";
        assert!(ServantConfig::from_yaml(yaml).is_err());

        let yaml = "mysql:\n  cache:\n    store: redis\n    redis_ttl: 2s\n";
        let config = ServantConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.mysql.cache.store, CacheStoreKind::Redis);
        assert_eq!(config.mysql.cache.redis_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("RIVVEN_SERVANT_TEST_HOST", "expanded.db");
        let yaml = r#"
mysql:
  servers:
    - pool: P
      host: ${RIVVEN_SERVANT_TEST_HOST}
      db: ${RIVVEN_SERVANT_TEST_UNSET_DB:-fallback}
"#;
        let config = ServantConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.mysql.servers[0].host, "expanded.db");
        assert_eq!(config.mysql.servers[0].db, "fallback");
    }

    #[test]
    fn test_missing_required_server_field() {
        let yaml = r#"
mysql:
  servers:
    - pool: P
      host: ""
      db: d
"#;
        let err = ServantConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_unknown_cache_store_is_fatal() {
        let yaml = r#"
mysql:
  cache:
    store: memcache
"#;
        assert!(ServantConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let yaml = "mysql:\n  shard_strategy: lunar\n";
        assert!(ServantConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_global_pool_without_servers_rejected() {
        let yaml = "mysql:\n  global_pools: [Ghost]\n";
        assert!(ServantConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_mixed_shard_base_rejected() {
        let yaml = r#"
mysql:
  shard_base_num: 2
  servers:
    - { pool: P, host: a, db: d }
    - { pool: P, host: b, db: d, shard_base_num: 3 }
"#;
        assert!(ServantConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_charset_rejected_at_load() {
        let yaml = r#"
mysql:
  servers:
    - { pool: P, host: a, db: d, charset: "utf8; DROP TABLE t" }
"#;
        let err = ServantConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("invalid charset"));

        let yaml = "mysql:\n  servers:\n    - { pool: P, host: a, db: d, charset: utf8mb4 }\n";
        assert!(ServantConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_idle_cap_above_max_rejected() {
        let yaml = "mysql:\n  max_idle_conns_per_server: 8\n  max_conns_per_server: 4\n";
        assert!(ServantConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_diff_detects_sections() {
        let old = ServantConfig::from_yaml(SAMPLE).unwrap();

        let same = old.clone();
        assert!(ConfigDiff::between(&old, &same).is_empty());

        let mut new = old.clone();
        new.mysql.max_conns_per_server = 20;
        let diff = ConfigDiff::between(&old, &new);
        assert!(diff.pools);
        assert!(!diff.topology);
        assert!(!diff.cache);

        let mut new = old.clone();
        new.mysql.servers[1].host = "user0-replacement.db".into();
        let diff = ConfigDiff::between(&old, &new);
        assert!(diff.topology);
        assert!(!diff.pools);

        let mut new = old.clone();
        new.mysql.cache.key_hash = false;
        let diff = ConfigDiff::between(&old, &new);
        assert!(diff.cache);
        assert!(!diff.topology && !diff.pools && !diff.merge);

        let mut new = old.clone();
        new.mysql.breaker.cooldown = Duration::from_secs(1);
        assert!(ConfigDiff::between(&old, &new).pools);
    }
}
