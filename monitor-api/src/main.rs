use monitor_core::{
    Result,
    config::Config,
    db::{create_pool, run_migrations},
    executor::CheckExecutor,
    logging,
    notify::dispatcher_from_config,
    store::{CheckStore, MonitorStore, PgCheckStore, PgMonitorStore},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

mod server;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    let config = Config::from_env()?;
    info!("Starting Monitor API server with config: {:?}", config.server);

    let db_pool = create_pool(&config.database).await?;
    info!("Database connection established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let monitors: Arc<dyn MonitorStore> = Arc::new(PgMonitorStore::new(db_pool.clone()));
    let checks: Arc<dyn CheckStore> = Arc::new(PgCheckStore::new(db_pool));
    let executor = CheckExecutor::from_config(
        &config,
        monitors.clone(),
        checks.clone(),
        dispatcher_from_config(&config.notification)?,
    )?;

    let state = Arc::new(server::AppState {
        monitors,
        checks,
        executor: Arc::new(executor),
    });

    let app = server::create_app(state);

    let listener = TcpListener::bind(&format!("{}:{}", config.server.host, config.server.port)).await?;

    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}
