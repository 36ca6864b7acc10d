use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, destination::DestinationPool},
    utils::config::get_config,
};
use ingestion_pipeline::{
    run_scheduler_loop, PipelineRunner, SchedulePolicy, Scheduler, StagedRecordRunner,
    UpsertEngine,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let pool = Arc::new(DestinationPool::new());
    let runner: Arc<dyn PipelineRunner> = Arc::new(StagedRecordRunner::new(
        Arc::clone(&pool),
        UpsertEngine::new(config.index_poll_policy()),
    ));
    let scheduler = Arc::new(Scheduler::new(
        db,
        runner,
        SchedulePolicy::from_config(&config),
    ));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested; finishing current tick");
        signal.cancel();
    });

    info!(
        retry_failed = config.retry_failed,
        lease_secs = config.lease_secs,
        "Starting scheduler"
    );
    run_scheduler_loop(scheduler, config.scheduler_tick(), shutdown).await;

    pool.shutdown().await;
    Ok(())
}
