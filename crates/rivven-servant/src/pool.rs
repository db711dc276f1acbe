//! Per-server connection pools
//!
//! One [`ServerPool`] exists per [`ServerDescriptor`]:
//! - Semaphore-bounded checkouts (`max_conns_per_server`)
//! - LIFO idle stack capped at `max_idle_conns_per_server`
//! - Background heartbeat probing one idle connection per interval
//! - A [`CircuitBreaker`] owned by the pool
//!
//! Pools are never mutated by reconfiguration; they are replaced. A replaced
//! pool [drains](ServerPool::drain): calls still running against an older
//! snapshot keep using it, and it retires once the last [`PoolSet`] holding
//! it is dropped.
//!
//! ```rust,ignore
//! let conn = pool.acquire().await?;
//! let rows = conn.query("SELECT 1", &[]).await?;
//! // Connection is returned to the pool when dropped
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::PoolSpec;
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, PoolError, Result};
use crate::metrics::ServantMetrics;
use crate::server::ServerDescriptor;
use crate::topology::ShardTopology;

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Server identity
    pub server: String,
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Slot waits that exceeded the connect timeout
    pub timeouts: u64,
    /// Failed heartbeat probes
    pub heartbeat_failures: u64,
    /// Idle connections
    pub idle: usize,
    /// Open connections (idle and checked out)
    pub open: usize,
    /// Time since the last heartbeat probe
    #[serde(with = "humantime_serde")]
    pub last_heartbeat_age: Option<Duration>,
    /// Breaker state
    pub breaker: Option<CircuitState>,
    /// Whether the pool has left the active topology
    pub draining: bool,
    /// Whether the pool has been retired
    pub retired: bool,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    heartbeat_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_heartbeat_failure(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Live pool bound to one server
pub struct ServerPool {
    server: Arc<ServerDescriptor>,
    spec: PoolSpec,
    factory: Arc<dyn ConnectionFactory>,
    breaker: CircuitBreaker,
    /// Bounds checked-out connections
    semaphore: Arc<Semaphore>,
    /// Idle connections (LIFO)
    idle: Mutex<Vec<Box<dyn Connection>>>,
    open: AtomicUsize,
    stats: AtomicPoolStats,
    /// Pool sets referencing this pool
    holders: AtomicUsize,
    draining: AtomicBool,
    retired: AtomicBool,
    last_heartbeat: Mutex<Option<Instant>>,
    shutdown: CancellationToken,
}

impl ServerPool {
    /// Create a pool and start its heartbeat.
    ///
    /// No connection is dialled until the first acquire or [`warm_up`](Self::warm_up).
    pub fn new(
        server: Arc<ServerDescriptor>,
        spec: PoolSpec,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            breaker: CircuitBreaker::new(server.id(), spec.breaker.clone()),
            semaphore: Arc::new(Semaphore::new(spec.max_open)),
            idle: Mutex::new(Vec::with_capacity(spec.max_idle)),
            open: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            holders: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            last_heartbeat: Mutex::new(None),
            shutdown: CancellationToken::new(),
            server,
            spec,
            factory,
        });
        pool.spawn_heartbeat();
        pool
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(server = %self.server, "no runtime, heartbeat disabled");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let interval = self.spec.heartbeat_interval;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = weak.upgrade() else { break };
                pool.heartbeat().await;
            }
        });
    }

    /// Server this pool connects to
    pub fn server(&self) -> &Arc<ServerDescriptor> {
        &self.server
    }

    /// Settings this pool was built with
    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    /// Breaker guarding this server
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Whether [`retire`](Self::retire) has been called
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Whether [`drain`](Self::drain) has been called
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn exhausted(&self, message: &str) -> Error {
        PoolError::Exhausted {
            server: self.server.id(),
            message: message.to_string(),
        }
        .into()
    }

    /// Check out a connection.
    ///
    /// Waits up to `connect_timeout` for a slot, then reuses the most
    /// recently returned idle connection or dials a new one.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_retired() {
            return Err(self.exhausted("pool retired"));
        }

        let start = Instant::now();
        let permit = match tokio::time::timeout(
            self.spec.connect_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.exhausted("pool retired")),
            Err(_) => {
                self.stats.record_timeout();
                ServantMetrics::increment_pool_timeouts(&self.server.address());
                return Err(PoolError::Timeout {
                    server: self.server.id(),
                    waited_ms: start.elapsed().as_millis() as u64,
                }
                .into());
            }
        };

        if self.is_retired() {
            return Err(self.exhausted("pool retired"));
        }

        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        self.stats.record_acquisition();
        tracing::trace!(
            server = %self.server,
            wait_us = start.elapsed().as_micros() as u64,
            "connection acquired"
        );

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            discard: false,
            _permit: permit,
        })
    }

    async fn dial(&self) -> Result<Box<dyn Connection>> {
        let conn = tokio::time::timeout(self.spec.connect_timeout, self.factory.connect(&self.server))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "connecting to {} timed out after {}ms",
                    self.server.address(),
                    self.spec.connect_timeout.as_millis()
                ))
            })??;

        self.open.fetch_add(1, Ordering::AcqRel);
        self.stats.record_created();
        ServantMetrics::increment_connections_created(&self.server.address());
        tracing::debug!(server = %self.server, backend = self.factory.backend(), "connection opened");
        Ok(conn)
    }

    fn release(&self, conn: Box<dyn Connection>, discard: bool) {
        if !discard {
            let mut idle = self.idle.lock();
            if !self.is_retired() && !self.is_draining() && idle.len() < self.spec.max_idle {
                idle.push(conn);
                return;
            }
        }
        self.close_detached(conn);
    }

    fn close_detached(&self, conn: Box<dyn Connection>) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = conn.close().await;
                });
            }
            Err(_) => drop(conn),
        }
    }

    /// Probe one idle connection.
    ///
    /// A failed probe discards the connection and counts against the breaker.
    pub async fn heartbeat(&self) {
        if self.is_retired() || self.is_draining() {
            return;
        }
        // Borrow a slot so the probe never pushes open connections past the cap.
        let Ok(_permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return;
        };
        let conn = {
            let mut idle = self.idle.lock();
            if idle.is_empty() {
                None
            } else {
                Some(idle.remove(0))
            }
        };
        *self.last_heartbeat.lock() = Some(Instant::now());
        let Some(conn) = conn else { return };

        let outcome = match tokio::time::timeout(self.spec.io_timeout, conn.ping()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("heartbeat timed out")),
        };

        match outcome {
            Ok(()) => self.release(conn, false),
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "heartbeat failed");
                self.stats.record_heartbeat_failure();
                ServantMetrics::increment_heartbeat_failures(&self.server.address());
                self.breaker.record_failure();
                self.release(conn, true);
            }
        }
    }

    /// Pre-dial up to `n` idle connections (capped at the idle limit).
    ///
    /// Returns the number of connections idle afterwards.
    pub async fn warm_up(self: &Arc<Self>, n: usize) -> Result<usize> {
        let target = n.min(self.spec.max_idle);
        let mut held = Vec::with_capacity(target);
        for _ in 0..target {
            held.push(self.acquire().await?);
        }
        drop(held);
        Ok(self.idle.lock().len())
    }

    /// Take the pool out of the active topology.
    ///
    /// Connections can still be acquired by calls that hold an older
    /// [`PoolSet`]. Idle connections are closed, returned ones are no longer
    /// kept and the heartbeat stops. The pool retires as soon as no pool set
    /// references it.
    pub fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let drained = std::mem::take(&mut *self.idle.lock());
        let count = drained.len();
        for conn in drained {
            self.close_detached(conn);
        }
        tracing::info!(server = %self.server, closed_idle = count, "pool draining");

        if self.holders.load(Ordering::SeqCst) == 0 {
            self.retire();
        }
    }

    fn hold(&self) {
        self.holders.fetch_add(1, Ordering::SeqCst);
    }

    fn unhold(&self) {
        if self.holders.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_draining() {
            self.retire();
        }
    }

    /// Stop handing out connections and close idle ones.
    ///
    /// Borrowed connections are closed when their guards drop.
    pub fn retire(&self) {
        if self.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.semaphore.close();

        let drained = std::mem::take(&mut *self.idle.lock());
        let count = drained.len();
        for conn in drained {
            self.close_detached(conn);
        }
        tracing::info!(server = %self.server, closed_idle = count, "pool retired");
    }

    /// Snapshot current stats
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            server: self.server.id(),
            connections_created: self.stats.connections_created.load(Ordering::Relaxed),
            connections_closed: self.stats.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.stats.acquisitions.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            heartbeat_failures: self.stats.heartbeat_failures.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            open: self.open.load(Ordering::Acquire),
            last_heartbeat_age: self.last_heartbeat.lock().map(|at| at.elapsed()),
            breaker: Some(self.breaker.state()),
            draining: self.is_draining(),
            retired: self.is_retired(),
        }
    }
}

impl Drop for ServerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("server", &self.server.id())
            .field("spec", &self.spec)
            .field("draining", &self.is_draining())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// A connection borrowed from a [`ServerPool`]
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<ServerPool>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool)
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Pool the connection belongs to
    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    /// Close the connection instead of returning it to the pool
    pub fn discard(mut self) {
        self.discard = true;
    }

    /// Choose whether dropping the guard closes the connection.
    ///
    /// Set while a statement is in flight so a cancelled call never hands a
    /// half-read session back to the pool.
    pub fn set_discard_on_drop(&mut self, discard: bool) {
        self.discard = discard;
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.discard);
        }
    }
}

/// Pools of every server in a topology, keyed by server identity.
///
/// Dropping the last set that references a [draining](ServerPool::drain)
/// pool retires it.
#[derive(Debug, Default)]
pub struct PoolSet {
    pools: BTreeMap<String, Arc<ServerPool>>,
}

impl PoolSet {
    /// Build pools for `topology`, reusing pools from `previous` whose server
    /// and settings are unchanged.
    ///
    /// Returns the new set and the previous pools it no longer references.
    pub fn build(
        topology: &ShardTopology,
        spec: &PoolSpec,
        factory: &Arc<dyn ConnectionFactory>,
        previous: Option<&PoolSet>,
    ) -> (Self, Vec<Arc<ServerPool>>) {
        let mut pools = BTreeMap::new();
        let mut reused = 0usize;

        for server in topology.servers() {
            let id = server.id();
            if pools.contains_key(&id) {
                continue;
            }
            let existing = previous
                .and_then(|p| p.pools.get(&id))
                .filter(|pool| **pool.server() == **server && pool.spec() == spec)
                .filter(|pool| !pool.is_retired());

            let pool = match existing {
                Some(pool) => {
                    reused += 1;
                    Arc::clone(pool)
                }
                None => ServerPool::new(Arc::clone(server), spec.clone(), Arc::clone(factory)),
            };
            pool.hold();
            pools.insert(id, pool);
        }

        let stale = previous
            .map(|p| {
                p.pools
                    .iter()
                    .filter(|(id, old)| {
                        pools
                            .get(*id)
                            .map_or(true, |new| !Arc::ptr_eq(new, *old))
                    })
                    .map(|(_, old)| Arc::clone(old))
                    .collect()
            })
            .unwrap_or_default();

        tracing::debug!(pools = pools.len(), reused, "pool set built");
        (Self { pools }, stale)
    }

    /// Pool of `server`
    pub fn get(&self, server: &ServerDescriptor) -> Option<&Arc<ServerPool>> {
        self.pools.get(&server.id())
    }

    /// All pools
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerPool>> {
        self.pools.values()
    }

    /// Number of pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Retire every pool
    pub fn retire_all(&self) {
        for pool in self.pools.values() {
            pool.retire();
        }
    }
}

impl Drop for PoolSet {
    fn drop(&mut self) {
        for pool in self.pools.values() {
            pool.unhold();
        }
    }
}
