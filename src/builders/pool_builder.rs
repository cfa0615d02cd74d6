//! Builders to construct worker pools from runtime configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::{RuntimeConfig, WorkerPoolConfig};
use crate::core::{
    LocalSchedulerClient, PoolError, Scheduler, SchedulerClient, WorkRegistry, WorkerFactory,
    WorkerPool,
};
use crate::runtime::factory_for;

/// Start one pool per configured entry, in name order.
///
/// `custom_factory` may supply a factory for a pool (remote workers, tests);
/// when it returns `None` the backend named in the pool's configuration is
/// used. If any pool fails to start, pools already started are shut down.
///
/// # Errors
///
/// `InvalidConfig` if the configuration does not validate, or the first
/// pool start failure.
pub async fn build_pools<F>(
    cfg: &RuntimeConfig,
    client: Arc<dyn SchedulerClient>,
    registry: Arc<WorkRegistry>,
    mut custom_factory: F,
) -> Result<Vec<Arc<WorkerPool>>, PoolError>
where
    F: FnMut(&WorkerPoolConfig) -> Option<Arc<dyn WorkerFactory>>,
{
    cfg.validate()
        .map_err(|e| PoolError::InvalidConfig(format!("config invalid: {e}")))?;

    let mut names: Vec<&String> = cfg.pools.keys().collect();
    names.sort();

    let mut pools: Vec<Arc<WorkerPool>> = Vec::with_capacity(names.len());
    for name in names {
        let pool_cfg = &cfg.pools[name];
        let factory = custom_factory(pool_cfg)
            .unwrap_or_else(|| factory_for(pool_cfg, Arc::clone(&registry)));
        match WorkerPool::start(pool_cfg.clone(), factory, Arc::clone(&client)).await {
            Ok(pool) => pools.push(Arc::new(pool)),
            Err(e) => {
                for pool in &pools {
                    pool.shutdown().await;
                }
                return Err(e);
            }
        }
    }

    Ok(pools)
}

/// A scheduler with its pools, all in this process.
pub struct Runtime {
    /// The shared scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Running pools, in name order.
    pub pools: Vec<Arc<WorkerPool>>,
}

impl Runtime {
    /// Pool named `name`.
    pub fn pool(&self, name: &str) -> Option<&Arc<WorkerPool>> {
        self.pools.iter().find(|pool| pool.name() == name)
    }

    /// Shut every pool down.
    pub async fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown().await;
        }
    }
}

/// Build a scheduler from `cfg.scheduler` and start its pools against it.
///
/// # Errors
///
/// See [`build_pools`].
pub async fn build_runtime(
    cfg: &RuntimeConfig,
    registry: Arc<WorkRegistry>,
) -> Result<Runtime, PoolError> {
    let scheduler = Arc::new(Scheduler::new(cfg.scheduler.clone()));
    let client: Arc<dyn SchedulerClient> =
        Arc::new(LocalSchedulerClient::new(Arc::clone(&scheduler)));
    let pools = build_pools(cfg, client, registry, |_| None).await?;
    info!(pools = pools.len(), "runtime started");
    Ok(Runtime { scheduler, pools })
}
