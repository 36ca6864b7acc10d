use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient, destination::DestinationPool, types::source_entry::SourceSelector,
    },
    utils::config::get_config,
};
use ingestion_pipeline::{PipelineRunner, SourceRegistry, StagedRecordRunner, UpsertEngine};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Register, remove or list ingestion sources.
#[derive(Debug, Parser)]
#[command(name = "register-source", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run a source once and register it when the run succeeds
    Register {
        /// Path to a JSON registration payload, or `-` for stdin
        payload: String,
    },
    /// Remove a source by id or by name
    #[command(group(ArgGroup::new("target").required(true).args(["id", "name"])))]
    Delete {
        id: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },
    /// Print every registered source
    List,
}

fn selector(id: Option<String>, name: Option<String>) -> Result<SourceSelector, AppError> {
    match (id, name) {
        (Some(id), None) => Ok(SourceSelector::Id(id)),
        (None, Some(name)) => Ok(SourceSelector::Name(name)),
        _ => Err(AppError::Validation("delete takes either an id or --name".to_string())),
    }
}

async fn read_payload(path: &str) -> Result<serde_json::Value, AppError> {
    let raw = if path == "-" {
        let mut buffer = String::new();
        tokio::io::stdin().read_to_string(&mut buffer).await?;
        buffer
    } else {
        tokio::fs::read_to_string(path).await?
    };

    serde_json::from_str(&raw)
        .map_err(|e| AppError::ConfigValidation(format!("registration payload is not JSON: {e}")))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

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
    let registry = SourceRegistry::new(db, runner);

    match cli.command {
        Command::Register { payload } => {
            let payload = read_payload(&payload).await?;
            let entry = registry.register_and_run_once(payload).await?;
            info!(source_id = %entry.id, "Source registered");
            println!("{}", entry.id);
        }
        Command::Delete { id, name } => registry.delete_source(&selector(id, name)?).await?,
        Command::List => {
            for entry in registry.list_sources().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.id,
                    entry.name.as_deref().unwrap_or("-"),
                    entry.status.as_str(),
                    entry
                        .last_run
                        .as_ref()
                        .map_or_else(|| "-".to_string(), common::storage::types::run_timestamp::format),
                );
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}
