use monitor_core::{
    Result,
    config::Config,
    db::{create_pool, run_migrations},
    executor::CheckExecutor,
    logging,
    notify::dispatcher_from_config,
    queue::RedisWorkQueue,
    store::{PgCheckStore, PgMonitorStore},
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    let config = Config::from_env()?;
    info!("Starting Monitor Worker with config: {:?}", config.executor);

    let db_pool = create_pool(&config.database).await?;
    info!("Database connection established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let queue = RedisWorkQueue::connect(&config.redis).await?;
    info!("Redis connection established");

    let executor = CheckExecutor::from_config(
        &config,
        Arc::new(PgMonitorStore::new(db_pool.clone())),
        Arc::new(PgCheckStore::new(db_pool)),
        dispatcher_from_config(&config.notification)?,
    )?;

    let worker = worker::CheckWorker::new(
        Arc::new(queue),
        Arc::new(executor),
        config.executor.max_concurrency,
        Duration::from_millis(config.redis.poll_interval_ms),
    );

    info!(
        "Monitor worker is running with {} slots. Press Ctrl+C to stop.",
        config.executor.max_concurrency
    );

    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    info!("Monitor worker stopped");
    Ok(())
}
