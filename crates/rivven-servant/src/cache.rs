//! Cache-aside store for query results
//!
//! [`CacheStore`] is the raw backend, either an in-process LRU or redis
//! (feature `redis`). Each entry is keyed by `(pool, table, predicate)` and
//! holds one field per statement variant, so reads with different select
//! lists never share a result while one delete still clears them all.
//!
//! [`CacheAside`] layers key derivation and result encoding on top and
//! absorbs every store failure: a broken cache degrades to a miss, never to
//! a failed call.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
#[cfg(feature = "redis")]
use std::time::Duration;

use crate::config::{CacheConfig, CacheStoreKind};
use crate::error::{Error, Result};
use crate::metrics::CallCounters;
use crate::types::QueryResult;

/// Bounded in-process LRU store
#[derive(Debug)]
pub struct MemStore {
    capacity: usize,
    items: Mutex<LruCache<String, HashMap<String, Vec<u8>>>>,
}

impl MemStore {
    /// Create a store holding at most `capacity` predicate entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            // Grows on demand; `LruCache::new` would preallocate the full capacity.
            items: Mutex::new(LruCache::unbounded()),
        }
    }

    fn get(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        self.items.lock().get(key).and_then(|fields| fields.get(field).cloned())
    }

    fn set(&self, key: &str, field: &str, value: Vec<u8>) {
        let mut items = self.items.lock();
        match items.get_mut(key) {
            Some(fields) => {
                fields.insert(field.to_string(), value);
            }
            None => {
                items.put(key.to_string(), HashMap::from([(field.to_string(), value)]));
            }
        }
        while items.len() > self.capacity {
            items.pop_lru();
        }
    }

    fn delete(&self, key: &str) {
        self.items.lock().pop(key);
    }

    /// Number of cached predicate entries
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Redis-backed store; entries expire after the configured TTL
#[cfg(feature = "redis")]
pub struct RedisStore {
    client: redis::Client,
    conn: tokio::sync::OnceCell<redis::aio::MultiplexedConnection>,
    ttl_secs: u64,
    timeout: Duration,
}

#[cfg(feature = "redis")]
impl RedisStore {
    /// Create a store for `url`; the connection is opened on first use
    pub fn new(url: &str, ttl: Duration, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::config(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            conn: tokio::sync::OnceCell::new(),
            ttl_secs: ttl.as_secs().max(1),
            timeout,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| Error::cache(format!("redis connect: {}", e)))
            })
            .await?;
        Ok(conn.clone())
    }

    async fn run<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce(redis::aio::MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            f(conn)
                .await
                .map_err(|e| Error::cache(format!("redis {}: {}", op, e)))
        };
        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| Error::cache(format!("redis {} timed out", op)))?
    }

    async fn get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        use redis::AsyncCommands;
        self.run("hget", |mut conn| async move { conn.hget(key, field).await })
            .await
    }

    async fn set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        use redis::AsyncCommands;
        let ttl = self.ttl_secs as i64;
        self.run("hset", |mut conn| async move {
            let _: () = conn.hset(key, field, value).await?;
            let _: bool = conn.expire(key, ttl).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        self.run("del", |mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }
}

#[cfg(feature = "redis")]
impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("ttl_secs", &self.ttl_secs)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

/// Cache backend
#[derive(Debug)]
pub enum CacheStore {
    /// In-process LRU
    Memory(MemStore),
    /// Remote redis
    #[cfg(feature = "redis")]
    Redis(RedisStore),
}

impl CacheStore {
    /// Build the store selected by configuration
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        match config.store {
            CacheStoreKind::Mem => Ok(Self::Memory(MemStore::new(config.mem_max_items))),
            #[cfg(feature = "redis")]
            CacheStoreKind::Redis => Ok(Self::Redis(RedisStore::new(
                &config.redis_url,
                config.redis_ttl,
                config.redis_timeout,
            )?)),
            #[cfg(not(feature = "redis"))]
            CacheStoreKind::Redis => Err(Error::config(
                "cache store 'redis' requires the `redis` feature",
            )),
        }
    }

    /// Backend kind
    pub fn kind(&self) -> CacheStoreKind {
        match self {
            Self::Memory(_) => CacheStoreKind::Mem,
            #[cfg(feature = "redis")]
            Self::Redis(_) => CacheStoreKind::Redis,
        }
    }

    /// Fetch the raw bytes of one field
    pub async fn get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Memory(store) => Ok(store.get(key, field)),
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.get(key, field).await,
        }
    }

    /// Store the raw bytes of one field
    pub async fn set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        match self {
            Self::Memory(store) => {
                store.set(key, field, value);
                Ok(())
            }
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.set(key, field, value).await,
        }
    }

    /// Remove an entry with all of its fields
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Self::Memory(store) => {
                store.delete(key);
                Ok(())
            }
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.delete(key).await,
        }
    }
}

/// Cache-aside wrapper used by the router and the merge coordinator
#[derive(Debug)]
pub struct CacheAside {
    store: CacheStore,
    key_hash: bool,
    counters: Arc<CallCounters>,
}

impl CacheAside {
    /// Wrap a store
    pub fn new(store: CacheStore, key_hash: bool, counters: Arc<CallCounters>) -> Self {
        Self {
            store,
            key_hash,
            counters,
        }
    }

    /// Build from configuration
    pub fn from_config(config: &CacheConfig, counters: Arc<CallCounters>) -> Result<Self> {
        Ok(Self::new(CacheStore::from_config(config)?, config.key_hash, counters))
    }

    /// Underlying store
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Cache key of a `(pool, table, predicate)` lookup
    pub fn key(&self, pool: &str, table: &str, predicate: &str) -> String {
        if self.key_hash {
            let digest = Sha256::digest(predicate.as_bytes());
            format!("{}:{}:{}", pool, table, hex::encode(digest))
        } else {
            format!("{}:{}:{}", pool, table, predicate)
        }
    }

    /// Field of a statement within its predicate entry
    pub fn variant(&self, sql: &str, args: &[String]) -> String {
        let mut text = sql.to_string();
        for arg in args {
            text.push('\u{1f}');
            text.push_str(arg);
        }
        if self.key_hash {
            hex::encode(Sha256::digest(text.as_bytes()))
        } else {
            text
        }
    }

    /// Cached result of `variant`, if any
    pub async fn lookup(&self, key: &str, variant: &str) -> Option<QueryResult> {
        let bytes = match self.store.get(key, variant).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.record_cache_miss();
                return None;
            }
            Err(e) => {
                self.absorb("get", key, &e);
                self.counters.record_cache_miss();
                return None;
            }
        };

        match serde_json::from_slice::<QueryResult>(&bytes) {
            Ok(result) => {
                self.counters.record_cache_hit();
                Some(result)
            }
            Err(e) => {
                self.absorb("decode", key, &Error::from(e));
                self.counters.record_cache_miss();
                None
            }
        }
    }

    /// Store the result of `variant`
    pub async fn populate(&self, key: &str, variant: &str, result: &QueryResult) {
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.absorb("encode", key, &Error::from(e));
                return;
            }
        };
        if let Err(e) = self.store.set(key, variant, bytes).await {
            self.absorb("set", key, &e);
        }
    }

    /// Drop every cached variant under `key`
    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            self.absorb("delete", key, &e);
        }
    }

    fn absorb(&self, op: &str, key: &str, error: &Error) {
        self.counters.record_cache_error();
        tracing::warn!(op, key, store = %self.store.kind(), error = %error, "cache operation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowSet;

    fn aside(key_hash: bool) -> CacheAside {
        CacheAside::new(
            CacheStore::Memory(MemStore::new(2)),
            key_hash,
            Arc::new(CallCounters::new()),
        )
    }

    fn result(v: &str) -> QueryResult {
        QueryResult::from_rows(RowSet::new(
            vec!["v".into()],
            vec![vec![Some(v.to_string())], vec![None]],
        ))
    }

    #[test]
    fn test_plain_and_hashed_keys() {
        assert_eq!(aside(false).key("UserShard", "UserInfo", "uid=7"), "UserShard:UserInfo:uid=7");

        let hashed = aside(true).key("UserShard", "UserInfo", "uid=7");
        let suffix = hashed.strip_prefix("UserShard:UserInfo:").unwrap();
        assert_eq!(suffix.len(), 64);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hashed, aside(true).key("UserShard", "UserInfo", "uid=8"));
    }

    #[tokio::test]
    async fn test_lookup_populate_invalidate() {
        let cache = aside(true);
        let key = cache.key("P", "t", "id=1");
        let variant = cache.variant("SELECT v FROM t WHERE id=1", &[]);
        assert!(cache.lookup(&key, &variant).await.is_none());

        cache.populate(&key, &variant, &result("a")).await;
        assert_eq!(cache.lookup(&key, &variant).await, Some(result("a")));

        cache.invalidate(&key).await;
        assert!(cache.lookup(&key, &variant).await.is_none());

        let snapshot = cache.counters.snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 2);
    }

    #[tokio::test]
    async fn test_variants_share_key_but_not_results() {
        let cache = aside(false);
        let key = cache.key("P", "t", "id=1");
        let narrow = cache.variant("SELECT v FROM t WHERE id=1", &[]);
        let wide = cache.variant("SELECT v, w FROM t WHERE id=1", &[]);
        let bound = cache.variant("SELECT v FROM t WHERE id=?", &["1".to_string()]);
        assert_ne!(narrow, wide);
        assert_ne!(narrow, bound);

        cache.populate(&key, &narrow, &result("a")).await;
        assert!(cache.lookup(&key, &wide).await.is_none());
        assert!(cache.lookup(&key, &bound).await.is_none());

        cache.populate(&key, &wide, &result("b")).await;
        assert_eq!(cache.lookup(&key, &narrow).await, Some(result("a")));
        assert_eq!(cache.lookup(&key, &wide).await, Some(result("b")));

        cache.invalidate(&key).await;
        assert!(cache.lookup(&key, &narrow).await.is_none());
        assert!(cache.lookup(&key, &wide).await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let cache = aside(false);
        cache.store().set("P:t:x", "q", b"not json".to_vec()).await.unwrap();
        assert!(cache.lookup("P:t:x", "q").await.is_none());
        assert_eq!(cache.counters.snapshot().cache_errors, 1);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_unreachable_redis_degrades_to_miss() {
        let store = RedisStore::new(
            "redis://127.0.0.1:1",
            Duration::from_secs(60),
            Duration::from_millis(200),
        )
        .unwrap();
        let cache = CacheAside::new(CacheStore::Redis(store), true, Arc::new(CallCounters::new()));
        let key = cache.key("P", "t", "id=1");
        let variant = cache.variant("SELECT v FROM t WHERE id=1", &[]);

        assert!(cache.lookup(&key, &variant).await.is_none());
        cache.populate(&key, &variant, &result("a")).await;
        cache.invalidate(&key).await;

        let snapshot = cache.counters.snapshot();
        assert_eq!(snapshot.cache_errors, 3);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_hits, 0);
    }

    #[test]
    fn test_mem_store_evicts_least_recent() {
        let store = MemStore::new(2);
        store.set("a", "x", vec![1]);
        store.set("b", "x", vec![2]);
        assert_eq!(store.get("a", "x"), Some(vec![1]));
        store.set("c", "x", vec![3]);
        assert_eq!(store.len(), 2);
        assert!(store.get("b", "x").is_none());
        assert!(store.get("a", "x").is_some());
        assert!(store.get("c", "x").is_some());

        // Extra fields do not count against the capacity
        store.set("a", "y", vec![4]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a", "y"), Some(vec![4]));
        assert!(store.get("a", "z").is_none());
    }

    #[test]
    fn test_store_selection() {
        let config = CacheConfig::default();
        let store = CacheStore::from_config(&config).unwrap();
        assert_eq!(store.kind(), CacheStoreKind::Mem);
    }
}
