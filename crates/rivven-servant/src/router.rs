//! Query/exec router
//!
//! Resolves a [`QueryRequest`] to a server through the shard topology, runs
//! it on that server's pool under the server's circuit breaker, and
//! materializes a [`QueryResult`]. Reads and writes with a cache predicate
//! go through the cache-aside layer.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::CacheAside;
use crate::error::{Error, PoolError, Result};
use crate::metrics::{CallCounters, ServantMetrics};
use crate::pool::{PoolSet, PooledConnection, ServerPool};
use crate::topology::ShardTopology;
use crate::types::{CallContext, QueryRequest, QueryResult, StatementKind};

/// Routes statements against one topology snapshot
#[derive(Debug, Clone)]
pub struct Router {
    topology: Arc<ShardTopology>,
    pools: Arc<PoolSet>,
    cache: Arc<CacheAside>,
    counters: Arc<CallCounters>,
    io_timeout: Duration,
    slow_call_threshold: Duration,
}

impl Router {
    /// Create a router
    pub fn new(
        topology: Arc<ShardTopology>,
        pools: Arc<PoolSet>,
        cache: Arc<CacheAside>,
        counters: Arc<CallCounters>,
        io_timeout: Duration,
        slow_call_threshold: Duration,
    ) -> Self {
        Self {
            topology,
            pools,
            cache,
            counters,
            io_timeout,
            slow_call_threshold,
        }
    }

    /// Topology snapshot
    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    /// Pools of the snapshot
    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    /// Cache-aside layer
    pub fn cache(&self) -> &Arc<CacheAside> {
        &self.cache
    }

    /// Execute a routed statement.
    ///
    /// `SELECT` statements return rows; anything else returns
    /// rows-affected / last-insert-id.
    pub async fn execute(&self, ctx: &CallContext, req: &QueryRequest) -> Result<QueryResult> {
        let kind = req.kind();
        let start = Instant::now();
        self.counters.record_call(kind);

        let result = within_deadline(ctx, self.route(kind, req)).await;

        let elapsed = start.elapsed();
        ServantMetrics::record_call_latency(kind.as_str(), elapsed);
        if elapsed >= self.slow_call_threshold {
            self.counters.record_slow_call();
            tracing::warn!(
                ctx = %ctx,
                pool = %req.pool,
                table = %req.table,
                hint = req.hint,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow {} call",
                kind
            );
        }

        match &result {
            Ok(r) => tracing::debug!(
                ctx = %ctx,
                pool = %req.pool,
                table = %req.table,
                hint = req.hint,
                rows = r.row_count(),
                rows_affected = r.rows_affected,
                elapsed_ms = elapsed.as_millis() as u64,
                "{} ok",
                kind
            ),
            Err(e) => {
                self.counters.record_error(&e.category().to_string());
                tracing::warn!(
                    ctx = %ctx,
                    pool = %req.pool,
                    table = %req.table,
                    hint = req.hint,
                    error = %e,
                    "{} failed",
                    kind
                );
            }
        }
        result
    }

    async fn route(&self, kind: StatementKind, req: &QueryRequest) -> Result<QueryResult> {
        let cache_slot = req.cache_predicate.as_deref().map(|predicate| {
            (
                self.cache.key(&req.pool, &req.table, predicate),
                self.cache.variant(&req.sql, &req.args),
            )
        });

        if kind == StatementKind::Read {
            if let Some((key, variant)) = &cache_slot {
                if let Some(hit) = self.cache.lookup(key, variant).await {
                    return Ok(hit);
                }
            }
        }

        let server = self.topology.resolve(&req.pool, req.hint)?;
        let pool = self.pools.get(&server).ok_or_else(|| PoolError::Exhausted {
            server: server.id(),
            message: "no pool for server".to_string(),
        })?;

        let result = self
            .run_on(pool, kind, &req.sql, &req.args)
            .await
            .map_err(|e| wrap_backend_error(req, e))?;

        if let Some((key, variant)) = &cache_slot {
            match kind {
                StatementKind::Read => self.cache.populate(key, variant, &result).await,
                StatementKind::Write => self.cache.invalidate(key).await,
            }
        }
        Ok(result)
    }

    async fn run_on(
        &self,
        pool: &Arc<ServerPool>,
        kind: StatementKind,
        sql: &str,
        args: &[String],
    ) -> Result<QueryResult> {
        let permit = pool.breaker().try_acquire()?;

        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                let failed: Result<QueryResult> = Err(e);
                permit.record(&failed);
                return failed;
            }
        };

        conn.set_discard_on_drop(true);
        let outcome = match tokio::time::timeout(self.io_timeout, run_statement(&conn, kind, sql, args)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::timeout(format!(
                "statement on {} exceeded {}ms",
                pool.server().address(),
                self.io_timeout.as_millis()
            ))),
        };
        permit.record(&outcome);

        let server_fault = matches!(&outcome, Err(e) if e.is_server_fault());
        conn.set_discard_on_drop(server_fault);
        drop(conn);

        outcome
    }
}

async fn run_statement(
    conn: &PooledConnection,
    kind: StatementKind,
    sql: &str,
    args: &[String],
) -> Result<QueryResult> {
    match kind {
        StatementKind::Read => conn.query(sql, args).await.map(QueryResult::from_rows),
        StatementKind::Write => conn.execute(sql, args).await.map(QueryResult::from_exec),
    }
}

fn wrap_backend_error(req: &QueryRequest, error: Error) -> Error {
    match error {
        Error::Routing(_) | Error::Pool(_) | Error::BreakerOpen { .. } => error,
        other => Error::statement(&req.pool, &req.table, &req.sql, other),
    }
}

/// Bound `fut` by the call deadline, if the context carries one
pub(crate) async fn within_deadline<T>(
    ctx: &CallContext,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match ctx.deadline {
        None => fut.await,
        Some(deadline) => tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
            .await
            .map_err(|_| {
                Error::timeout(format!("call {} exceeded its deadline", ctx.request_id))
            })?,
    }
}
