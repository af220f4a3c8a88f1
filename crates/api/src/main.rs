use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use energy_registry_api::app::{create_app, AppState};
use energy_registry_api::config::Config;
use energy_registry_api::jobs::{
    DailySubmissionJob, JobScheduler, ProgressTrackingJob, RetryFailedJob, SubmissionCleanupJob,
};
use energy_registry_api::middleware::{init_metrics, logging::init_logging};
use energy_registry_api::services::HttpRegistryClient;
use persistence::repositories::{ReadingRepository, SubmissionRepository};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load()?;
    init_logging(&config.logging);
    init_metrics()?;

    info!("Starting energy registry service v{}", env!("CARGO_PKG_VERSION"));

    let pool = persistence::db::create_pool(&config.pool_config()).await?;

    info!("Running database migrations...");
    sqlx::migrate!("../persistence/src/migrations")
        .run(&pool)
        .await?;
    info!("Migrations completed");

    let registry = Arc::new(HttpRegistryClient::new(&config.registry)?);
    let state = AppState::new(
        Arc::new(config.clone()),
        Arc::new(ReadingRepository::new(pool.clone())),
        Arc::new(SubmissionRepository::new(pool.clone())),
        registry,
        Some(pool),
    );

    // Work left behind by a previous process.
    if let Err(e) = state
        .pipeline
        .resume_incomplete(config.scheduler.batch_size)
        .await
    {
        warn!(error = %e, "Could not resume incomplete submissions");
    }

    let mut scheduler = JobScheduler::new();
    if config.scheduler.enabled {
        let settings = &config.scheduler;
        scheduler.register(DailySubmissionJob::new(
            Arc::clone(&state.aggregator),
            Arc::clone(&state.pipeline),
            Arc::clone(&state.readings),
            settings.clone(),
        ));
        scheduler.register(ProgressTrackingJob::new(
            Arc::clone(&state.pipeline),
            settings.progress_poll_minutes,
            settings.batch_size,
        ));
        scheduler.register(RetryFailedJob::new(
            Arc::clone(&state.pipeline),
            settings.retry_failed_max_age_hours,
            settings.batch_size,
        ));
        scheduler.register(SubmissionCleanupJob::new(
            Arc::clone(state.pipeline.store()),
            settings.retention_days,
        ));
        scheduler.start();
    } else {
        info!("Background jobs disabled");
    }

    let app = create_app(state);
    let addr = config.socket_addr()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    scheduler.wait_for_shutdown(Duration::from_secs(30)).await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
