//! Servant metrics
//!
//! Instrumentation goes through the `metrics` crate facade; without an
//! installed recorder every call is a no-op. Names follow
//! `rivven_servant_{name}_{unit}`.
//!
//! [`CallCounters`] keeps the in-process totals behind
//! `Servant::runtime()` and the periodic stats log.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::breaker::CircuitState;
use crate::types::StatementKind;

/// Servant metrics recorded through the `metrics` facade
pub struct ServantMetrics;

impl ServantMetrics {
    // ---- Counters ----

    /// Routed statements, labelled by `qry` / `exc`
    pub fn increment_calls(kind: StatementKind) {
        metrics::counter!("rivven_servant_calls_total", "kind" => kind.as_str()).increment(1);
    }

    /// Failed calls, labelled by error category
    pub fn increment_errors(category: &str) {
        metrics::counter!("rivven_servant_errors_total", "category" => category.to_string())
            .increment(1);
    }

    /// Calls slower than the configured threshold
    pub fn increment_slow_calls() {
        metrics::counter!("rivven_servant_slow_calls_total").increment(1);
    }

    /// Cache hits
    pub fn increment_cache_hits() {
        metrics::counter!("rivven_servant_cache_hits_total").increment(1);
    }

    /// Cache misses
    pub fn increment_cache_misses() {
        metrics::counter!("rivven_servant_cache_misses_total").increment(1);
    }

    /// Absorbed cache store failures
    pub fn increment_cache_errors() {
        metrics::counter!("rivven_servant_cache_errors_total").increment(1);
    }

    /// Completed merges, labelled by outcome
    pub fn increment_merges(ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        metrics::counter!("rivven_servant_merges_total", "outcome" => outcome).increment(1);
    }

    /// Breaker state changes, labelled by target state
    pub fn increment_breaker_transitions(server: &str, to: CircuitState) {
        metrics::counter!(
            "rivven_servant_breaker_transitions_total",
            "server" => server.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    /// Connections dialled
    pub fn increment_connections_created(server: &str) {
        metrics::counter!("rivven_servant_connections_created_total", "server" => server.to_string())
            .increment(1);
    }

    /// Slot waits that ran out of time
    pub fn increment_pool_timeouts(server: &str) {
        metrics::counter!("rivven_servant_pool_timeouts_total", "server" => server.to_string())
            .increment(1);
    }

    /// Failed idle probes
    pub fn increment_heartbeat_failures(server: &str) {
        metrics::counter!("rivven_servant_heartbeat_failures_total", "server" => server.to_string())
            .increment(1);
    }

    /// Applied reconfigurations
    pub fn increment_reloads(ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        metrics::counter!("rivven_servant_reloads_total", "outcome" => outcome).increment(1);
    }

    // ---- Gauges ----

    /// Merge keys currently locked or awaited
    pub fn set_merge_locks_outstanding(count: usize) {
        metrics::gauge!("rivven_servant_merge_locks_outstanding").set(count as f64);
    }

    // ---- Histograms ----

    /// End-to-end call latency
    pub fn record_call_latency(kind: &'static str, elapsed: Duration) {
        metrics::histogram!("rivven_servant_call_latency_seconds", "kind" => kind)
            .record(elapsed.as_secs_f64());
    }

    /// Time spent waiting for a merge key lock
    pub fn record_merge_lock_wait(elapsed: Duration) {
        metrics::histogram!("rivven_servant_merge_lock_wait_seconds").record(elapsed.as_secs_f64());
    }
}

/// In-process call totals
#[derive(Debug)]
pub struct CallCounters {
    started: Instant,
    queries: AtomicU64,
    execs: AtomicU64,
    merges: AtomicU64,
    errors: AtomicU64,
    slow_calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
}

impl Default for CallCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CallCounters {
    /// Counters starting now
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            queries: AtomicU64::new(0),
            execs: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            slow_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_errors: AtomicU64::new(0),
        }
    }

    /// Record a routed statement
    pub fn record_call(&self, kind: StatementKind) {
        match kind {
            StatementKind::Read => self.queries.fetch_add(1, Ordering::Relaxed),
            StatementKind::Write => self.execs.fetch_add(1, Ordering::Relaxed),
        };
        ServantMetrics::increment_calls(kind);
    }

    /// Record a merge attempt
    pub fn record_merge(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed call
    pub fn record_error(&self, category: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        ServantMetrics::increment_errors(category);
    }

    /// Record a slow call
    pub fn record_slow_call(&self) {
        self.slow_calls.fetch_add(1, Ordering::Relaxed);
        ServantMetrics::increment_slow_calls();
    }

    /// Record a cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        ServantMetrics::increment_cache_hits();
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        ServantMetrics::increment_cache_misses();
    }

    /// Record an absorbed cache failure
    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
        ServantMetrics::increment_cache_errors();
    }

    /// Snapshot current totals
    pub fn snapshot(&self) -> CallCountersSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;
        CallCountersSnapshot {
            uptime: self.started.elapsed(),
            queries: self.queries.load(Ordering::Relaxed),
            execs: self.execs.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            slow_calls: self.slow_calls.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            cache_hit_ratio: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
        }
    }
}

/// Point-in-time copy of [`CallCounters`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallCountersSnapshot {
    /// Time since the counters were created
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    /// Reads routed
    pub queries: u64,
    /// Writes routed
    pub execs: u64,
    /// Merges attempted
    pub merges: u64,
    /// Calls that returned an error
    pub errors: u64,
    /// Calls above the slow threshold
    pub slow_calls: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Absorbed cache failures
    pub cache_errors: u64,
    /// `hits / (hits + misses)`, 0 without lookups
    pub cache_hit_ratio: f64,
}

impl CallCountersSnapshot {
    /// Total routed calls
    pub fn total_calls(&self) -> u64 {
        self.queries + self.execs + self.merges
    }
}
