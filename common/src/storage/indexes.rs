use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};
use tracing::{info, warn};

use crate::{error::AppError, storage::db::SurrealDbClient};

/// A cosine HNSW index over one embedding field of a destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIndexDescriptor {
    pub name: String,
    pub table: String,
    pub field: String,
    pub dimension: usize,
}

impl VectorIndexDescriptor {
    pub const METRIC: &'static str = "COSINE";

    fn definition_if_not_exists(&self) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} \
             FIELDS {field} HNSW DIMENSION {dimension} DIST {metric} TYPE F32 CONCURRENTLY;",
            index = self.name,
            table = self.table,
            field = self.field,
            dimension = self.dimension,
            metric = Self::METRIC,
        )
    }
}

/// How long and how often to wait for a freshly submitted index to become queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for IndexPollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

impl IndexPollPolicy {
    /// Doubling delays starting at `initial_interval`, capped at `max_interval`.
    fn backoff(&self) -> ExponentialBackoff {
        let initial_ms = u64::try_from(self.initial_interval.as_millis()).unwrap_or(u64::MAX);
        // `from_millis(2)` yields 2, 4, 8.. which `factor` scales to initial, 2*initial, ..
        ExponentialBackoff::from_millis(2)
            .factor((initial_ms / 2).max(1))
            .max_delay(self.max_interval)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexBuildSnapshot {
    pub status: String,
    pub initial: u64,
    pub pending: u64,
    pub updated: u64,
}

impl IndexBuildSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status.eq_ignore_ascii_case("ready")
    }

    fn is_error(&self) -> bool {
        self.status.eq_ignore_ascii_case("error")
    }
}

/// The store operations the index manager needs.
#[async_trait]
pub trait IndexCatalog: Send + Sync {
    /// Definition of the named index on `table`, if it exists.
    async fn find_index(&self, table: &str, index_name: &str) -> Result<Option<String>, AppError>;

    /// Submit an index definition. Must be idempotent for an existing index.
    async fn create_index(&self, descriptor: &VectorIndexDescriptor) -> Result<(), AppError>;

    /// Current build progress. `None` when the store reports nothing for the index.
    async fn index_build_status(
        &self,
        table: &str,
        index_name: &str,
    ) -> Result<Option<IndexBuildSnapshot>, AppError>;
}

#[async_trait]
impl IndexCatalog for SurrealDbClient {
    async fn find_index(&self, table: &str, index_name: &str) -> Result<Option<String>, AppError> {
        let info_query = format!("INFO FOR TABLE {table};");
        let mut response = self
            .client
            .query(info_query)
            .await
            .with_context(|| format!("fetching table info for {table}"))?;

        let info: surrealdb::Value = response
            .take(0)
            .context("failed to take table info response")?;

        let info_json: Value =
            serde_json::to_value(info).context("serializing table info to JSON for parsing")?;

        Ok(index_definition(&info_json, index_name))
    }

    async fn create_index(&self, descriptor: &VectorIndexDescriptor) -> Result<(), AppError> {
        let res = self
            .client
            .query(descriptor.definition_if_not_exists())
            .await
            .map_err(|e| {
                AppError::IndexCreation(format!(
                    "creating index {} on table {}: {e}",
                    descriptor.name, descriptor.table
                ))
            })?;
        res.check().map_err(|e| {
            AppError::IndexCreation(format!(
                "index definition rejected for {} on {}: {e}",
                descriptor.name, descriptor.table
            ))
        })?;
        Ok(())
    }

    async fn index_build_status(
        &self,
        table: &str,
        index_name: &str,
    ) -> Result<Option<IndexBuildSnapshot>, AppError> {
        let info_query = format!("INFO FOR INDEX {index_name} ON TABLE {table};");
        let mut info_res = self.client.query(info_query).await.with_context(|| {
            format!("checking index build status for {index_name} on {table}")
        })?;

        let info: Option<Value> = info_res
            .take(0)
            .context("failed to deserialize INFO FOR INDEX result")?;

        Ok(parse_index_build_info(info))
    }
}

/// `INFO FOR TABLE` comes back either as plain JSON or in Surreal's tagged form
/// (`{"Object": {"indexes": {"Object": {name: {"Strand": ..}}}}}`).
fn index_definition(info: &Value, index_name: &str) -> Option<String> {
    let untag = |value: &Value| value.get("Object").cloned().unwrap_or_else(|| value.clone());

    let table_info = untag(info);
    let indexes = untag(table_info.get("indexes")?);
    let definition = indexes.get(index_name)?;

    definition
        .as_str()
        .or_else(|| definition.get("Strand").and_then(Value::as_str))
        .map(ToString::to_string)
}

fn parse_index_build_info(info: Option<Value>) -> Option<IndexBuildSnapshot> {
    let info = info?;
    let building = info.get("building");

    let field = |name: &str| {
        building
            .and_then(|b| b.get(name))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };

    let status = building
        .and_then(|b| b.get("status"))
        .and_then(|s| s.as_str())
        // No `building` block means the index is no longer building.
        .unwrap_or("ready")
        .to_string();

    Some(IndexBuildSnapshot {
        status,
        initial: field("initial"),
        pending: field("pending"),
        updated: field("updated"),
    })
}

fn extract_dimension(definition: &str) -> Option<u64> {
    definition
        .split("DIMENSION")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.trim_end_matches(';').parse::<u64>().ok())
}

enum PollError {
    NotReady(String),
    Failed(AppError),
}

/// Make sure `descriptor` exists on its table and is queryable.
///
/// An existing index with the same name is reused as-is. Otherwise the definition is
/// submitted (`IF NOT EXISTS`, so racing callers cannot clobber each other) and the
/// build is polled with exponential backoff until ready. Exceeding `policy.timeout`
/// or a build error yields [`AppError::IndexCreation`].
pub async fn ensure_vector_index<C>(
    catalog: &C,
    descriptor: &VectorIndexDescriptor,
    policy: &IndexPollPolicy,
) -> Result<(), AppError>
where
    C: IndexCatalog + ?Sized,
{
    // Checked twice: another batch may submit the index between the two lookups.
    if reuse_existing(catalog, descriptor).await? || reuse_existing(catalog, descriptor).await? {
        return Ok(());
    }

    catalog.create_index(descriptor).await?;
    info!(
        index = %descriptor.name,
        table = %descriptor.table,
        dimension = descriptor.dimension,
        "Vector index definition submitted; waiting for build to finish"
    );

    let started_at = std::time::Instant::now();
    let poll = RetryIf::spawn(
        policy.backoff(),
        || poll_once(catalog, descriptor),
        |err: &PollError| matches!(err, PollError::NotReady(_)),
    );

    match tokio::time::timeout(policy.timeout, poll).await {
        Ok(Ok(())) => {
            info!(
                index = %descriptor.name,
                table = %descriptor.table,
                elapsed = ?started_at.elapsed(),
                "Vector index is ready"
            );
            Ok(())
        }
        Ok(Err(PollError::Failed(err))) => Err(err),
        Ok(Err(PollError::NotReady(status))) => Err(AppError::IndexCreation(format!(
            "index {} on {} stopped polling while {status}",
            descriptor.name, descriptor.table
        ))),
        Err(_) => Err(AppError::IndexCreation(format!(
            "index {} on {} not queryable after {:?}",
            descriptor.name, descriptor.table, policy.timeout
        ))),
    }
}

async fn reuse_existing<C>(
    catalog: &C,
    descriptor: &VectorIndexDescriptor,
) -> Result<bool, AppError>
where
    C: IndexCatalog + ?Sized,
{
    let Some(definition) = catalog.find_index(&descriptor.table, &descriptor.name).await? else {
        return Ok(false);
    };

    match extract_dimension(&definition) {
        Some(existing) if existing != descriptor.dimension as u64 => warn!(
            index = %descriptor.name,
            table = %descriptor.table,
            existing_dimension = existing,
            configured_dimension = descriptor.dimension,
            "Vector index exists with a different dimension; reusing it"
        ),
        _ => info!(
            index = %descriptor.name,
            table = %descriptor.table,
            "Vector index already exists"
        ),
    }
    Ok(true)
}

async fn poll_once<C>(catalog: &C, descriptor: &VectorIndexDescriptor) -> Result<(), PollError>
where
    C: IndexCatalog + ?Sized,
{
    let snapshot = catalog
        .index_build_status(&descriptor.table, &descriptor.name)
        .await
        .map_err(PollError::Failed)?;

    let Some(snapshot) = snapshot else {
        warn!(
            index = %descriptor.name,
            table = %descriptor.table,
            "INFO FOR INDEX returned no data; assuming index definition might be missing"
        );
        return Ok(());
    };

    if snapshot.is_ready() {
        return Ok(());
    }

    if snapshot.is_error() {
        return Err(PollError::Failed(AppError::IndexCreation(format!(
            "index {} on {} failed to build",
            descriptor.name, descriptor.table
        ))));
    }

    info!(
        index = %descriptor.name,
        table = %descriptor.table,
        status = %snapshot.status,
        initial = snapshot.initial,
        pending = snapshot.pending,
        updated = snapshot.updated,
        "Index build in progress"
    );
    Err(PollError::NotReady(snapshot.status))
}
