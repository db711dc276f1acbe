//! Cluster context snapshots
//!
//! A [`ClusterContext`] bundles everything one call needs: configuration,
//! topology, pools (with their breakers), the cache and the merge
//! coordinator. Calls capture an `Arc<ClusterContext>` when they start and
//! finish against it even if a reload swaps in a newer context meanwhile.

use serde::Serialize;
use std::sync::Arc;

use crate::cache::CacheAside;
use crate::config::{ConfigDiff, ServantConfig};
use crate::connection::ConnectionFactory;
use crate::error::Result;
use crate::merge::{MergeCoordinator, MergeKeyLocks};
use crate::metrics::CallCounters;
use crate::pool::{PoolSet, ServerPool};
use crate::router::Router;
use crate::topology::ShardTopology;

/// Shared parts that outlive any single context
#[derive(Clone)]
pub struct ClusterServices {
    /// Database driver
    pub factory: Arc<dyn ConnectionFactory>,
    /// Merge key registry, kept across reloads so in-flight merges stay exclusive
    pub locks: Arc<MergeKeyLocks>,
    /// Call totals
    pub counters: Arc<CallCounters>,
}

impl std::fmt::Debug for ClusterServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterServices")
            .field("backend", &self.factory.backend())
            .field("merge_locks", &self.locks.outstanding())
            .finish()
    }
}

/// What a reconfiguration changed
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    /// Generation of the context now active
    pub generation: u64,
    /// Sections that differed
    pub diff: ConfigDiff,
    /// Pools in the new context
    pub pools: usize,
    /// Pools carried over unchanged
    pub pools_reused: usize,
    /// Pools created for new or changed servers
    pub pools_created: usize,
    /// Pools dropped from the topology; they drain before retiring
    pub pools_retired: usize,
    /// Whether the cache store was rebuilt
    pub cache_rebuilt: bool,
}

/// Immutable snapshot of the servant's routing state
#[derive(Debug)]
pub struct ClusterContext {
    generation: u64,
    config: ServantConfig,
    router: Router,
    merger: MergeCoordinator,
}

impl ClusterContext {
    /// Build the first context
    pub fn initial(config: ServantConfig, services: &ClusterServices) -> Result<Self> {
        let (context, _, _) = Self::build(config, None, services)?;
        Ok(context)
    }

    /// Build a context for `config`, reusing what `previous` already has.
    ///
    /// Nothing observable changes until the caller installs the returned
    /// context and drains the returned stale pools. On error `previous`
    /// stays valid.
    pub fn build(
        config: ServantConfig,
        previous: Option<&ClusterContext>,
        services: &ClusterServices,
    ) -> Result<(Self, ReloadReport, Vec<Arc<ServerPool>>)> {
        config.check()?;

        let diff = match previous {
            Some(prev) => ConfigDiff::between(&prev.config, &config),
            None => ConfigDiff {
                topology: true,
                pools: true,
                cache: true,
                merge: true,
                reporting: true,
            },
        };

        let topology = match previous {
            Some(prev) if !diff.topology => Arc::clone(prev.router.topology()),
            _ => Arc::new(ShardTopology::from_config(&config.mysql)?),
        };

        let cache = match previous {
            Some(prev) if !diff.cache => Arc::clone(prev.router.cache()),
            _ => Arc::new(CacheAside::from_config(
                &config.mysql.cache,
                Arc::clone(&services.counters),
            )?),
        };

        let (pools, stale) = match previous {
            Some(prev) if !diff.topology && !diff.pools => (Arc::clone(prev.router.pools()), Vec::new()),
            _ => {
                let (pools, stale) = PoolSet::build(
                    &topology,
                    &config.mysql.pool_spec(),
                    &services.factory,
                    previous.map(|prev| prev.router.pools().as_ref()),
                );
                (Arc::new(pools), stale)
            }
        };

        let pools_reused = previous.map_or(0, |prev| {
            pools
                .iter()
                .filter(|pool| {
                    prev.router
                        .pools()
                        .get(pool.server())
                        .is_some_and(|old| Arc::ptr_eq(old, pool))
                })
                .count()
        });

        if diff.merge {
            services.locks.reconfigure(config.mysql.merge.clone());
        }

        let router = Router::new(
            topology,
            Arc::clone(&pools),
            cache,
            Arc::clone(&services.counters),
            config.mysql.io_timeout,
            config.slow_call_threshold,
        );
        let merger = MergeCoordinator::new(
            router.clone(),
            Arc::clone(&services.locks),
            Arc::clone(&services.counters),
        );

        let generation = previous.map_or(1, |prev| prev.generation + 1);
        let report = ReloadReport {
            generation,
            diff,
            pools: pools.len(),
            pools_reused,
            pools_created: pools.len() - pools_reused,
            pools_retired: stale.len(),
            cache_rebuilt: diff.cache,
        };

        Ok((
            Self {
                generation,
                config,
                router,
                merger,
            },
            report,
            stale,
        ))
    }

    /// Monotonic context number, 1 for the initial context
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Configuration this context was built from
    pub fn config(&self) -> &ServantConfig {
        &self.config
    }

    /// Topology snapshot
    pub fn topology(&self) -> &Arc<ShardTopology> {
        self.router.topology()
    }

    /// Server pools
    pub fn pools(&self) -> &Arc<PoolSet> {
        self.router.pools()
    }

    /// Cache-aside layer
    pub fn cache(&self) -> &Arc<CacheAside> {
        self.router.cache()
    }

    /// Statement router
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Merge coordinator
    pub fn merger(&self) -> &MergeCoordinator {
        &self.merger
    }
}
