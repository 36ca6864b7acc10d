use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        destination::DestinationPool,
        types::pipeline_config::{PipelineConfig, S3Credentials, SourceSpec},
    },
};
use futures::TryStreamExt;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, path::Path as ObjPath, ObjectMeta, ObjectStore,
};
use serde_json::Value;
use tracing::{info, instrument, warn};
use url::Url;

use super::PipelineRunner;
use crate::upsert::UpsertEngine;

const STAGED_EXTENSION: &str = "json";

/// Reads records that upstream stages already parsed, chunked and embedded.
///
/// Every `*.json` object under the source location must hold a JSON array of
/// records; each file is upserted as one batch.
pub struct StagedRecordRunner {
    pool: Arc<DestinationPool>,
    upsert: UpsertEngine,
}

impl StagedRecordRunner {
    pub fn new(pool: Arc<DestinationPool>, upsert: UpsertEngine) -> Self {
        Self { pool, upsert }
    }
}

fn open_store(source: &SourceSpec) -> Result<(Arc<dyn ObjectStore>, Option<ObjPath>), AppError> {
    match source {
        SourceSpec::Local { path, .. } => {
            let store = LocalFileSystem::new_with_prefix(path).map_err(|e| {
                AppError::PipelineExecution(format!("cannot open local source {path}: {e}"))
            })?;
            Ok((Arc::new(store), None))
        }
        SourceSpec::S3 {
            remote_url,
            credentials,
            ..
        } => {
            let url = Url::parse(remote_url).map_err(|e| {
                AppError::PipelineExecution(format!("invalid s3 url {remote_url}: {e}"))
            })?;
            let bucket = url.host_str().unwrap_or_default();
            let prefix = url.path().trim_matches('/');

            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(S3Credentials {
                access_key_id,
                secret_access_key,
                session_token,
            }) = credentials
            {
                builder = builder
                    .with_access_key_id(access_key_id)
                    .with_secret_access_key(secret_access_key);
                if let Some(token) = session_token {
                    builder = builder.with_token(token);
                }
            }

            let store = builder.build()?;
            let prefix = (!prefix.is_empty()).then(|| ObjPath::from(prefix));
            Ok((Arc::new(store), prefix))
        }
        SourceSpec::GoogleDrive { .. } => Err(AppError::PipelineExecution(
            "google_drive sources have no staged-record reader; stage them to local or s3"
                .to_string(),
        )),
    }
}

async fn staged_files(
    store: &dyn ObjectStore,
    prefix: Option<&ObjPath>,
) -> Result<Vec<ObjectMeta>, AppError> {
    let mut files: Vec<ObjectMeta> = store
        .list(prefix)
        .try_filter(|meta| futures::future::ready(meta.location.extension() == Some(STAGED_EXTENSION)))
        .try_collect()
        .await?;
    files.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));
    Ok(files)
}

#[async_trait]
impl PipelineRunner for StagedRecordRunner {
    #[instrument(skip_all, fields(source_type = config.source.kind(), collection = %config.destination.collection))]
    async fn run(&self, config: &PipelineConfig) -> Result<u64, AppError> {
        let (store, prefix) = open_store(&config.source)?;
        let files = staged_files(store.as_ref(), prefix.as_ref()).await?;

        if files.is_empty() {
            warn!("No staged record files found");
            return Ok(0);
        }

        let destination = self.pool.handle(&config.destination).await?;
        let mut written: u64 = 0;

        for file in &files {
            let bytes = store.get(&file.location).await?.bytes().await?;
            let records: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| {
                AppError::PipelineExecution(format!(
                    "{} is not a JSON array of records: {e}",
                    file.location
                ))
            })?;

            let summary = self.upsert.upsert_batch(&destination, records).await?;
            written = written.saturating_add(summary.written as u64);
        }

        info!(files = files.len(), written, "Staged records synced");
        Ok(written)
    }
}
