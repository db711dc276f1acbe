//! JSON column merge
//!
//! A merge is a read-modify-write of one JSON column:
//!
//! 1. lock the merge key
//! 2. read the column (exactly one row, cache-aside)
//! 3. deep-merge the patch into the stored object
//! 4. write the merged document back
//! 5. invalidate the cached read
//!
//! Merges on the same key are serialized in lock-grant order. Merges on
//! different keys never wait on each other.

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;

use crate::config::MergeConfig;
use crate::error::{Error, Result};
use crate::metrics::{CallCounters, ServantMetrics};
use crate::router::{within_deadline, Router};
use crate::types::{CallContext, MergeRequest, QueryRequest};

#[derive(Debug)]
struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters
    refs: usize,
}

/// Registry of per-key async mutexes.
///
/// Entries are created on first use and removed once the last holder or
/// waiter is gone, so the registry only holds keys with outstanding merges.
#[derive(Debug)]
pub struct MergeKeyLocks {
    config: RwLock<MergeConfig>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl MergeKeyLocks {
    /// Create an empty registry
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config: RwLock::new(config),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Apply new limits; outstanding locks are kept
    pub fn reconfigure(&self, config: MergeConfig) {
        *self.config.write() = config;
    }

    /// Keys currently locked or awaited
    pub fn outstanding(&self) -> usize {
        self.slots.lock().len()
    }

    /// Wait for exclusive ownership of `key`.
    ///
    /// Fails with [`Error::MergeLockExhausted`] when the registry is full and
    /// with [`Error::MergeLockTimeout`] when the wait exceeds the lock timeout.
    pub async fn lock(&self, key: &str) -> Result<MergeLockGuard<'_>> {
        let config = self.config.read().clone();
        let slot = self.register(key, config.max_outstanding_keys)?;

        let start = Instant::now();
        let guard = tokio::time::timeout(config.lock_timeout, Arc::clone(&slot.mutex).lock_owned())
            .await
            .map_err(|_| Error::MergeLockTimeout {
                key: key.to_string(),
            })?;

        let waited = start.elapsed();
        ServantMetrics::record_merge_lock_wait(waited);
        tracing::debug!(key, wait_us = waited.as_micros() as u64, "merge lock acquired");

        Ok(MergeLockGuard {
            _guard: guard,
            _slot: slot,
        })
    }

    fn register(&self, key: &str, limit: usize) -> Result<SlotRef<'_>> {
        let mut slots = self.slots.lock();
        if !slots.contains_key(key) && slots.len() >= limit {
            return Err(Error::MergeLockExhausted { limit });
        }
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            refs: 0,
        });
        slot.refs += 1;
        let mutex = Arc::clone(&slot.mutex);
        ServantMetrics::set_merge_locks_outstanding(slots.len());

        Ok(SlotRef {
            locks: self,
            key: key.to_string(),
            mutex,
        })
    }

    fn unregister(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
        ServantMetrics::set_merge_locks_outstanding(slots.len());
    }
}

/// One holder's or waiter's claim on a registry slot
struct SlotRef<'a> {
    locks: &'a MergeKeyLocks,
    key: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        self.locks.unregister(&self.key);
    }
}

/// Exclusive ownership of a merge key; released on drop
pub struct MergeLockGuard<'a> {
    // Field order matters: unlock before releasing the slot.
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef<'a>,
}

impl std::fmt::Debug for MergeLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeLockGuard")
            .field("key", &self._slot.key)
            .finish()
    }
}

/// Merge `patch` into `target`.
///
/// Objects merge key by key, recursing where both sides hold an object.
/// Anything else (arrays, scalars, null) in the patch replaces the target.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => merge_objects(target, patch),
        (target, patch) => *target = patch,
    }
}

fn merge_objects(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match target.get_mut(&key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                deep_merge(existing, value)
            }
            _ => {
                target.insert(key, value);
            }
        }
    }
}

/// Reject anything but `[A-Za-z_][A-Za-z0-9_]*` (at most 64 chars, the MySQL limit)
pub fn validate_identifier(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidIdentifier {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > 64 {
        return Err(invalid("longer than 64 characters"));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(invalid("must start with a letter or underscore")),
    }
    if chars.any(|c| !c.is_ascii_alphanumeric() && c != '_') {
        return Err(invalid("may only contain letters, digits and underscores"));
    }
    Ok(())
}

fn parse_object(text: &str, what: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::serialization(format!(
            "{} must be a JSON object, got {}",
            what,
            json_kind(&other)
        ))),
        Err(e) => Err(Error::serialization(format!("{} is not valid JSON: {}", what, e))),
    }
}

/// A stored JSON `null` starts from an empty object, like SQL `NULL`
fn parse_stored(text: &str) -> Result<Map<String, Value>> {
    if matches!(serde_json::from_str::<Value>(text), Ok(Value::Null)) {
        return Ok(Map::new());
    }
    parse_object(text, "stored value")
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Runs merges against one router snapshot
#[derive(Debug, Clone)]
pub struct MergeCoordinator {
    router: Router,
    locks: Arc<MergeKeyLocks>,
    counters: Arc<CallCounters>,
}

impl MergeCoordinator {
    /// Create a coordinator
    pub fn new(router: Router, locks: Arc<MergeKeyLocks>, counters: Arc<CallCounters>) -> Self {
        Self {
            router,
            locks,
            counters,
        }
    }

    /// Lock registry
    pub fn locks(&self) -> &Arc<MergeKeyLocks> {
        &self.locks
    }

    /// Merge `req.patch` into the JSON column selected by `req.predicate`.
    ///
    /// Returns `true` once the merged document has been written. Never
    /// retried: a failure leaves the row untouched unless the write itself
    /// was the step that failed.
    pub async fn merge(&self, ctx: &CallContext, req: &MergeRequest) -> Result<bool> {
        self.counters.record_merge();
        let start = Instant::now();

        // Failures of the routed read and write are counted by the router
        let mut routed_failure = false;
        let result = within_deadline(ctx, self.run(ctx, req, &mut routed_failure)).await;

        ServantMetrics::increment_merges(result.is_ok());
        ServantMetrics::record_call_latency("merge", start.elapsed());
        match &result {
            Ok(_) => tracing::debug!(
                ctx = %ctx,
                pool = %req.pool,
                table = %req.table,
                key = %req.key,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "merge applied"
            ),
            Err(e) => {
                if !routed_failure {
                    self.counters.record_error(&e.category().to_string());
                }
                tracing::warn!(
                    ctx = %ctx,
                    pool = %req.pool,
                    table = %req.table,
                    key = %req.key,
                    error = %e,
                    "merge failed"
                );
            }
        }
        result
    }

    async fn run(
        &self,
        ctx: &CallContext,
        req: &MergeRequest,
        routed_failure: &mut bool,
    ) -> Result<bool> {
        validate_identifier(&req.table)?;
        validate_identifier(&req.column)?;
        let patch = parse_object(&req.patch, "patch")?;

        let _lock = self.locks.lock(&req.key).await?;

        let uncached = QueryRequest::new(
            &req.pool,
            &req.table,
            req.hint,
            format!("SELECT {} FROM {} WHERE {}", req.column, req.table, req.predicate),
        );
        let cached = uncached.clone().with_cache_predicate(&req.predicate);

        let mut current = self
            .router
            .execute(ctx, &cached)
            .await
            .inspect_err(|_| *routed_failure = true)?;
        if current.columns.len() != 1 || current.columns[0] != req.column {
            tracing::debug!(
                key = %req.key,
                columns = ?current.columns,
                "cached read does not select the merge column, reading from server"
            );
            current = self
                .router
                .execute(ctx, &uncached)
                .await
                .inspect_err(|_| *routed_failure = true)?;
        }

        if current.rows.len() != 1 {
            return Err(Error::InvalidRowCount {
                expected: 1,
                actual: current.rows.len(),
            });
        }

        let mut merged = match current.rows[0].first().cloned().flatten() {
            None => Map::new(),
            Some(stored) => parse_stored(&stored)?,
        };
        merge_objects(&mut merged, patch);
        let document = serde_json::to_string(&Value::Object(merged))?;

        let write = QueryRequest::new(
            &req.pool,
            &req.table,
            req.hint,
            format!("UPDATE {} SET {}=? WHERE {}", req.table, req.column, req.predicate),
        )
        .with_args(vec![document]);
        self.router
            .execute(ctx, &write)
            .await
            .inspect_err(|_| *routed_failure = true)?;

        let key = self.router.cache().key(&req.pool, &req.table, &req.predicate);
        self.router.cache().invalidate(&key).await;

        Ok(true)
    }
}
