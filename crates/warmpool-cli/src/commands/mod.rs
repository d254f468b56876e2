// Command implementations
//
// Every command talks to the Postgres store of the configured partition;
// the ones that start or stop workers also need the execution service.

pub mod drain;
pub mod grab;
pub mod monitor;
pub mod reap;
pub mod replenish;
pub mod seed;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use warmpool::execution::HttpExecutionService;
use warmpool::{PoolConfig, PostgresLeaseStore, WorkerLauncher};

/// Connect to the pool's store, applying pending migrations and dropping
/// change rows older than the configured retention
pub async fn connect_store(config: &PoolConfig) -> Result<Arc<PostgresLeaseStore>> {
    let store = PostgresLeaseStore::connect(config.database_url()?)
        .await
        .context("Failed to connect to the pool database")?
        .with_partition(&config.partition)
        .with_change_feed(config.change_feed.clone());

    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;

    match store.prune_changes(config.change_feed.retention).await {
        Ok(0) => {}
        Ok(pruned) => debug!(pruned, "pruned stale change rows"),
        Err(e) => warn!(error = %e, "Failed to prune stale change rows"),
    }

    debug!(partition = %config.partition, "connected to pool store");
    Ok(Arc::new(store))
}

pub fn execution_service(config: &PoolConfig) -> Result<Arc<HttpExecutionService>> {
    let service = HttpExecutionService::new(config.execution_api_url()?, &config.cluster)
        .context("Failed to create execution service client")?;
    Ok(Arc::new(service))
}

pub fn launcher(
    config: &PoolConfig,
    store: Arc<PostgresLeaseStore>,
) -> Result<Arc<WorkerLauncher>> {
    let launcher_config = config
        .launcher_config()
        .context("Launch configuration incomplete")?;
    Ok(Arc::new(WorkerLauncher::new(
        store,
        execution_service(config)?,
        launcher_config,
    )))
}
