mod staged;

pub use staged::StagedRecordRunner;

use async_trait::async_trait;
use common::{error::AppError, storage::types::pipeline_config::PipelineConfig};

/// Runs one full sync for a source: pull from the source, produce normalized
/// records, and hand every batch to [`crate::upsert::UpsertEngine::upsert_batch`].
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Returns the number of records written to the destination.
    async fn run(&self, config: &PipelineConfig) -> Result<u64, AppError>;
}
