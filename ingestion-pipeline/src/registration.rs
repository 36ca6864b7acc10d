use std::sync::Arc;

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            pipeline_config::PipelineConfig,
            source_entry::{SourceEntry, SourceSelector},
        },
    },
};
use serde_json::Value;
use tracing::{info, instrument};

use crate::pipeline::PipelineRunner;

/// Registers sources after a successful first sync and removes them again.
pub struct SourceRegistry {
    db: Arc<SurrealDbClient>,
    runner: Arc<dyn PipelineRunner>,
}

impl SourceRegistry {
    pub fn new(db: Arc<SurrealDbClient>, runner: Arc<dyn PipelineRunner>) -> Self {
        Self { db, runner }
    }

    /// Validate an untyped registration payload, run it once and persist it.
    ///
    /// Nothing is stored unless the first run succeeds.
    #[instrument(skip_all)]
    pub async fn register_and_run_once(&self, payload: Value) -> Result<SourceEntry, AppError> {
        let config = PipelineConfig::from_json(payload)?;

        let written = self.runner.run(&config).await?;

        let entry = SourceEntry::new_completed(&config, Utc::now());
        let stored = entry.insert(&self.db).await?;
        info!(
            source_id = %stored.id,
            name = ?stored.name,
            source_type = config.source.kind(),
            written,
            sync_interval_seconds = stored.sync_interval_seconds,
            "Registered source after first run"
        );
        Ok(stored)
    }

    /// Remove a source. Runs already in flight finish; their final status write
    /// finds no entry and does nothing.
    pub async fn delete_source(&self, selector: &SourceSelector) -> Result<(), AppError> {
        match SourceEntry::delete(&self.db, selector).await? {
            Some(entry) => info!(source_id = %entry.id, "Deleted source"),
            None => info!(?selector, "No source matched; nothing to delete"),
        }
        Ok(())
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceEntry>, AppError> {
        SourceEntry::list(&self.db).await
    }
}
