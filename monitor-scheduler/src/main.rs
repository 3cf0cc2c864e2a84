use monitor_core::{
    Result,
    config::Config,
    db::{create_pool, run_migrations},
    logging,
    queue::RedisWorkQueue,
    store::PgMonitorStore,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

mod scheduler;

use scheduler::{ClaimDispatcher, MonitorScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    let config = Config::from_env()?;
    info!("Starting Monitor Scheduler with config: {:?}", config.scheduler);

    let db_pool = create_pool(&config.database).await?;
    info!("Database connection established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let queue = RedisWorkQueue::connect(&config.redis).await?;
    info!("Redis connection established");

    let dispatcher = Arc::new(ClaimDispatcher::from_config(
        &config,
        Arc::new(PgMonitorStore::new(db_pool)),
        Arc::new(queue),
    )?);

    let mut scheduler = MonitorScheduler::new(
        dispatcher,
        Duration::from_millis(config.scheduler.tick_interval_ms),
    )
    .await?;
    scheduler.start().await?;

    info!("Monitor scheduler is running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    scheduler.stop().await?;

    Ok(())
}
