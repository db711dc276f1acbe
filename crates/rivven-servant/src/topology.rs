//! Shard topology
//!
//! An immutable snapshot mapping `(pool, hint)` to a physical server.
//! Global pools always resolve to their designated (first) server; sharded
//! pools pick the server at `strategy.shard_index(hint, shard_base)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::config::MysqlConfig;
use crate::error::{Error, Result, RoutingError};
use crate::server::ServerDescriptor;

/// Maps a routing hint onto a shard index
pub trait ShardStrategy: Send + Sync + fmt::Debug {
    /// Strategy name as used in configuration
    fn name(&self) -> &'static str;

    /// Shard index in `[0, shard_base)`
    fn shard_index(&self, hint: i64, shard_base: u64) -> u64;
}

/// `hint mod shard_base`, with negative hints folded into range
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardStrategy;

impl ShardStrategy for StandardStrategy {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn shard_index(&self, hint: i64, shard_base: u64) -> u64 {
        (i128::from(hint).rem_euclid(i128::from(shard_base))) as u64
    }
}

/// Murmur2 of the big-endian hint bytes, modulo the shard base.
///
/// Spreads sequential ids that would otherwise cluster on neighbouring shards.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashStrategy;

impl ShardStrategy for HashStrategy {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn shard_index(&self, hint: i64, shard_base: u64) -> u64 {
        u64::from(murmur2(&hint.to_be_bytes())) % shard_base
    }
}

/// Look up a strategy by its configured name
pub fn strategy_for(name: &str) -> Result<Arc<dyn ShardStrategy>> {
    match name {
        "standard" => Ok(Arc::new(StandardStrategy)),
        "hash" => Ok(Arc::new(HashStrategy)),
        other => Err(Error::config(format!("unknown shard strategy '{}'", other))),
    }
}

/// Kafka-compatible murmur2 hash (seed 0x9747b28c).
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h
}

/// Immutable shard topology snapshot
#[derive(Debug, Clone)]
pub struct ShardTopology {
    shard_base: u64,
    strategy: Arc<dyn ShardStrategy>,
    global_pools: BTreeSet<String>,
    pools: BTreeMap<String, Vec<Arc<ServerDescriptor>>>,
}

impl ShardTopology {
    /// Build a topology from already-constructed descriptors.
    ///
    /// Servers keep their order within each pool.
    pub fn new(
        shard_base: u64,
        strategy: Arc<dyn ShardStrategy>,
        global_pools: BTreeSet<String>,
        servers: impl IntoIterator<Item = ServerDescriptor>,
    ) -> Result<Self> {
        if shard_base == 0 {
            return Err(Error::config("shard base must be greater than zero"));
        }

        let mut pools: BTreeMap<String, Vec<Arc<ServerDescriptor>>> = BTreeMap::new();
        for server in servers {
            pools
                .entry(server.pool().to_string())
                .or_default()
                .push(Arc::new(server));
        }

        Ok(Self {
            shard_base,
            strategy,
            global_pools,
            pools,
        })
    }

    /// Build a topology from the mysql configuration section
    pub fn from_config(config: &MysqlConfig) -> Result<Self> {
        let strategy = strategy_for(&config.shard_strategy)?;
        let servers = config
            .servers
            .iter()
            .map(|s| ServerDescriptor::from_config(s, config.shard_base_of(s), config.connect_timeout))
            .collect::<Result<Vec<_>>>()?;

        Self::new(
            config.shard_base_num,
            strategy,
            config.global_pools.clone(),
            servers,
        )
    }

    /// Resolve the server responsible for `hint` in `pool`
    pub fn resolve(&self, pool: &str, hint: i64) -> Result<Arc<ServerDescriptor>> {
        let servers = self
            .pools
            .get(pool)
            .filter(|servers| !servers.is_empty())
            .ok_or_else(|| RoutingError::UnknownPool {
                pool: pool.to_string(),
            })?;

        if self.global_pools.contains(pool) {
            return Ok(Arc::clone(&servers[0]));
        }

        let shard_base = servers[0].shard_base();
        let index = self.strategy.shard_index(hint, shard_base);
        usize::try_from(index)
            .ok()
            .and_then(|i| servers.get(i))
            .cloned()
            .ok_or_else(|| {
                RoutingError::IndexOutOfRange {
                    pool: pool.to_string(),
                    index,
                    servers: servers.len(),
                }
                .into()
            })
    }

    /// Whether `pool` is unsharded
    pub fn is_global(&self, pool: &str) -> bool {
        self.global_pools.contains(pool)
    }

    /// Default shard base
    pub fn shard_base(&self) -> u64 {
        self.shard_base
    }

    /// Active strategy
    pub fn strategy(&self) -> &dyn ShardStrategy {
        self.strategy.as_ref()
    }

    /// Pool names
    pub fn pools(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Servers of one pool, in shard order
    pub fn servers_of(&self, pool: &str) -> &[Arc<ServerDescriptor>] {
        self.pools.get(pool).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All servers across pools
    pub fn servers(&self) -> impl Iterator<Item = &Arc<ServerDescriptor>> {
        self.pools.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server(pool: &str, host: &str, base: u64) -> ServerDescriptor {
        ServerDescriptor::new(pool, host, 3306, "", "", "db", "utf8", base, Duration::ZERO).unwrap()
    }

    fn topology(strategy: &str) -> ShardTopology {
        ShardTopology::new(
            4,
            strategy_for(strategy).unwrap(),
            ["ShardLookup".to_string()].into_iter().collect(),
            vec![
                server("ShardLookup", "lookup", 4),
                server("UserShard", "u0", 4),
                server("UserShard", "u1", 4),
                server("UserShard", "u2", 4),
                server("UserShard", "u3", 4),
                server("Short", "s0", 4),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_global_pool_ignores_hint() {
        let t = topology("standard");
        for hint in [i64::MIN, -7, 0, 1, 3, 99, i64::MAX] {
            assert_eq!(t.resolve("ShardLookup", hint).unwrap().host(), "lookup");
        }
        assert!(t.is_global("ShardLookup"));
        assert!(!t.is_global("UserShard"));
    }

    #[test]
    fn test_congruent_hints_route_identically() {
        let t = topology("standard");
        for hint in -20i64..20 {
            let a = t.resolve("UserShard", hint).unwrap();
            let b = t.resolve("UserShard", hint + 4 * 1_000).unwrap();
            assert_eq!(a.id(), b.id());
        }
        assert_eq!(t.resolve("UserShard", 6).unwrap().host(), "u2");
        assert_eq!(t.resolve("UserShard", -1).unwrap().host(), "u3");
    }

    #[test]
    fn test_unknown_pool() {
        let t = topology("standard");
        let err = t.resolve("Nope", 1).unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::UnknownPool { ref pool }) if pool == "Nope"
        ));
    }

    #[test]
    fn test_index_out_of_range() {
        let t = topology("standard");
        assert!(t.resolve("Short", 0).is_ok());
        let err = t.resolve("Short", 2).unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::IndexOutOfRange {
                index: 2,
                servers: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_hash_strategy_is_deterministic_and_in_range() {
        let s = HashStrategy;
        for hint in 0..1_000 {
            let idx = s.shard_index(hint, 4);
            assert!(idx < 4);
            assert_eq!(idx, s.shard_index(hint, 4));
        }
        let t = topology("hash");
        assert_eq!(t.strategy().name(), "hash");
        assert!(t.resolve("UserShard", 12345).is_ok());
    }

    #[test]
    fn test_murmur2_matches_kafka() {
        assert_eq!(murmur2(b"hello"), 1682149141);
    }

    #[test]
    fn test_unknown_strategy() {
        assert!(strategy_for("lunar").is_err());
    }

    #[test]
    fn test_accessors() {
        let t = topology("standard");
        assert_eq!(t.pools().collect::<Vec<_>>(), vec!["ShardLookup", "Short", "UserShard"]);
        assert_eq!(t.servers_of("UserShard").len(), 4);
        assert_eq!(t.servers().count(), 6);
        assert!(t.servers_of("Nope").is_empty());
    }
}
