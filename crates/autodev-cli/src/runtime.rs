//! Process wiring: builds the orchestrator components from resolved
//! configuration.
//!
//! Vendor adapters are pluggable; until one is registered the process
//! runs with the unconfigured stubs, which fail tasks cleanly instead of
//! hanging. Deployments link their adapters in and swap them here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Mutex;

use autodev_core::coalesce::{BatchCoalescer, CoalescerConfig};
use autodev_core::driver::{DriverConfig, TaskDriver};
use autodev_core::host::{SourceHost, UnconfiguredSourceHost};
use autodev_core::ingress::Ingress;
use autodev_core::model::{ModelClient, UnconfiguredModelClient};
use autodev_core::runner::JobRunnerConfig;
use autodev_core::selector::ModelSelector;
use autodev_core::settings::OrchestratorSettings;

use crate::config::AutodevConfig;
use crate::serve_cmd::AppState;

/// Build the shared application state from resolved configuration.
///
/// The pool is sized to the configured parallelism: each concurrent
/// driver needs a connection, plus headroom for the API surface.
pub async fn build_state(config: &AutodevConfig) -> Result<Arc<AppState>> {
    let pool_cap = (config.settings.max_parallel as u32 * 2).max(config.db_config.max_connections);
    let db_config = config.db_config.clone().with_max_connections(pool_cap);
    let pool = autodev_db::pool::create_pool(&db_config).await?;
    Ok(build_state_with(
        pool,
        config.settings.clone(),
        Arc::new(UnconfiguredModelClient),
        Arc::new(UnconfiguredSourceHost),
    ))
}

/// Build state around explicit collaborator implementations. Tests use
/// this with mock clients and hosts.
pub fn build_state_with(
    pool: PgPool,
    settings: OrchestratorSettings,
    client: Arc<dyn ModelClient>,
    host: Arc<dyn SourceHost>,
) -> Arc<AppState> {
    let settings = Arc::new(settings);

    let selector = Arc::new(ModelSelector::new(
        pool.clone(),
        Duration::from_secs(settings.model_config_ttl_seconds),
    ));

    let coalescer = Arc::new(BatchCoalescer::new(
        pool.clone(),
        CoalescerConfig {
            base_branch: "main".to_string(),
            min_batch_size: settings.min_batch_size,
            max_batch_size: settings.max_batch_size,
            batch_timeout: Duration::from_secs(settings.batch_timeout_minutes * 60),
        },
    ));

    let driver = Arc::new(TaskDriver::new(
        pool.clone(),
        client,
        Arc::clone(&host),
        Arc::clone(&selector),
        Arc::clone(&coalescer),
        Arc::clone(&settings),
        DriverConfig::default(),
    ));

    let ingress = Arc::new(Ingress::new(pool.clone(), Arc::clone(&settings)));

    let runner_config = JobRunnerConfig {
        max_parallel: settings.max_parallel,
        continue_on_error: true,
    };

    Arc::new(AppState {
        pool,
        settings,
        selector,
        ingress,
        driver,
        coalescer,
        host,
        runner_config,
        job_cancels: Mutex::new(HashMap::new()),
    })
}
