//! Servant facade
//!
//! [`Servant`] is the entry point behind the RPC boundary. It holds the
//! active [`ClusterContext`] and swaps it atomically on reconfiguration:
//!
//! ```rust,ignore
//! let servant = Servant::new(config, Arc::new(MySqlConnectionFactory))?;
//! let rows = servant
//!     .query(&ctx, &QueryRequest::new("UserShard", "UserInfo", uid, sql))
//!     .await?;
//! servant.reconfigure(ServantConfig::from_file("servant.yaml")?)?;
//! ```

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterContext, ClusterServices, ReloadReport};
use crate::config::{CacheStoreKind, ServantConfig};
use crate::connection::ConnectionFactory;
use crate::error::{PoolError, Result};
use crate::merge::MergeKeyLocks;
use crate::metrics::{CallCounters, CallCountersSnapshot, ServantMetrics};
use crate::pool::PoolStats;
use crate::types::{CallContext, MergeRequest, QueryRequest, QueryResult};

/// Read-only view of servant health
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    /// Active context generation
    pub generation: u64,
    /// Call totals, uptime and cache hit ratio
    pub calls: CallCountersSnapshot,
    /// Active cache backend
    pub cache_store: CacheStoreKind,
    /// Per-server pool stats and breaker state
    pub servers: Vec<PoolStats>,
    /// Merge keys currently locked or awaited
    pub merge_locks_outstanding: usize,
    /// Whether [`Servant::close`] has been called
    pub closed: bool,
}

/// Result of warming up one server
#[derive(Debug, Clone, Serialize)]
pub struct WarmUpOutcome {
    /// Server identity
    pub server: String,
    /// Idle connections after warm-up
    pub idle: usize,
    /// Failure, if any
    pub error: Option<String>,
}

/// Sharded data-access servant
pub struct Servant {
    active: RwLock<Arc<ClusterContext>>,
    services: ClusterServices,
    reload_lock: Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Servant {
    /// Build a servant; invalid configuration is fatal here
    pub fn new(config: ServantConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        let services = ClusterServices {
            factory,
            locks: Arc::new(MergeKeyLocks::new(config.mysql.merge.clone())),
            counters: Arc::new(CallCounters::new()),
        };
        let context = ClusterContext::initial(config, &services)?;

        tracing::info!(
            servers = context.pools().len(),
            pools = context.topology().pools().count(),
            strategy = context.topology().strategy().name(),
            cache = %context.cache().store().kind(),
            backend = services.factory.backend(),
            "servant started"
        );

        Ok(Arc::new(Self {
            active: RwLock::new(Arc::new(context)),
            services,
            reload_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Context new calls run against
    pub fn context(&self) -> Arc<ClusterContext> {
        Arc::clone(&self.active.read())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Exhausted {
                server: "*".to_string(),
                message: "servant closed".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Route and execute one statement
    pub async fn query(&self, ctx: &CallContext, req: &QueryRequest) -> Result<QueryResult> {
        self.ensure_open()?;
        let context = self.context();
        context.router().execute(ctx, req).await
    }

    /// Merge a JSON patch into one row's JSON column
    pub async fn merge(&self, ctx: &CallContext, req: &MergeRequest) -> Result<bool> {
        self.ensure_open()?;
        let context = self.context();
        context.merger().merge(ctx, req).await
    }

    /// Apply a new configuration.
    ///
    /// Unchanged subsystems keep their instances. Invalid configuration
    /// leaves the active context untouched.
    pub fn reconfigure(&self, config: ServantConfig) -> Result<ReloadReport> {
        self.ensure_open()?;
        let _serial = self.reload_lock.lock();
        let current = self.context();

        let (next, report, stale) = match ClusterContext::build(config, Some(&current), &self.services) {
            Ok(built) => built,
            Err(e) => {
                ServantMetrics::increment_reloads(false);
                tracing::error!(error = %e, generation = current.generation(), "reconfiguration rejected");
                return Err(e);
            }
        };

        let previous = std::mem::replace(&mut *self.active.write(), Arc::new(next));
        drop(previous);
        // Calls holding an older context finish on these pools
        for pool in &stale {
            pool.drain();
        }

        ServantMetrics::increment_reloads(true);
        tracing::info!(
            generation = report.generation,
            topology = report.diff.topology,
            pools_changed = report.diff.pools,
            cache = report.diff.cache,
            merge = report.diff.merge,
            reused = report.pools_reused,
            created = report.pools_created,
            retired = report.pools_retired,
            "reconfiguration applied"
        );
        Ok(report)
    }

    /// Health snapshot
    pub fn runtime(&self) -> RuntimeSnapshot {
        let context = self.context();
        RuntimeSnapshot {
            generation: context.generation(),
            calls: self.services.counters.snapshot(),
            cache_store: context.cache().store().kind(),
            servers: context.pools().iter().map(|pool| pool.stats()).collect(),
            merge_locks_outstanding: self.services.locks.outstanding(),
            closed: self.closed.load(Ordering::Acquire),
        }
    }

    /// Liveness probe
    pub fn ping(&self) -> &'static str {
        "pong"
    }

    /// Dial idle connections on every server
    pub async fn warm_up(&self) -> Vec<WarmUpOutcome> {
        let context = self.context();
        let mut outcomes = Vec::with_capacity(context.pools().len());

        for pool in context.pools().iter() {
            let server = pool.server().id();
            let outcome = match pool.warm_up(pool.spec().max_idle).await {
                Ok(idle) => WarmUpOutcome {
                    server,
                    idle,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "warm-up failed");
                    WarmUpOutcome {
                        server,
                        idle: pool.stats().idle,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        tracing::info!(servers = outcomes.len(), failed, "warm-up finished");
        outcomes
    }

    /// Stop background tasks and drain every pool
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.context().pools().retire_all();
        tracing::info!("servant closed");
    }

    /// Log call totals every `stats_output_interval`
    pub fn spawn_stats_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let servant = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = servant.context().config().stats_output_interval;
                tokio::select! {
                    _ = servant.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                servant.log_stats();
            }
        })
    }

    fn log_stats(&self) {
        let snapshot = self.runtime();
        let calls = &snapshot.calls;
        let open_breakers = snapshot
            .servers
            .iter()
            .filter(|s| s.breaker.is_some_and(|b| b != crate::breaker::CircuitState::Closed))
            .count();
        tracing::info!(
            generation = snapshot.generation,
            uptime_s = calls.uptime.as_secs(),
            queries = calls.queries,
            execs = calls.execs,
            merges = calls.merges,
            errors = calls.errors,
            slow_calls = calls.slow_calls,
            cache_hit_ratio = calls.cache_hit_ratio,
            servers = snapshot.servers.len(),
            open_breakers,
            merge_locks = snapshot.merge_locks_outstanding,
            "servant stats"
        );
    }

    /// Reconfigure whenever a new configuration is published on `updates`
    pub fn spawn_reload_listener(
        self: &Arc<Self>,
        mut updates: watch::Receiver<ServantConfig>,
    ) -> JoinHandle<()> {
        let servant = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = servant.shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let config = updates.borrow_and_update().clone();
                if let Err(e) = servant.reconfigure(config) {
                    tracing::warn!(error = %e, "keeping previous configuration");
                }
            }
        })
    }
}

impl std::fmt::Debug for Servant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servant")
            .field("generation", &self.context().generation())
            .field("services", &self.services)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for Servant {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
