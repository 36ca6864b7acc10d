use std::collections::HashMap;

use common::{
    error::AppError,
    storage::{
        destination::DestinationHandle,
        indexes::{ensure_vector_index, IndexPollPolicy},
        types::pipeline_config::DestinationSettings,
    },
};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::identity::{identity_of, lookup_path, IDENTITY_FIELD};

/// Where an incoming `id` key is kept. The store owns `id` as the record id.
pub const SOURCE_ID_FIELD: &str = "source_id";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Records handed to the engine.
    pub received: usize,
    /// Records written after collapsing duplicate identities.
    pub written: usize,
    /// Distinct identities whose earlier records were replaced.
    pub superseded: usize,
    pub chunks: usize,
}

/// Writes normalized records into a destination so that each identity is stored once.
#[derive(Debug, Clone, Default)]
pub struct UpsertEngine {
    index_policy: IndexPollPolicy,
}

impl UpsertEngine {
    pub fn new(index_policy: IndexPollPolicy) -> Self {
        Self { index_policy }
    }

    /// Replace every stored record sharing an identity with this batch, then make sure
    /// the destination's vector index exists.
    ///
    /// Deletion and insertion are separate statements; a reader in between can see
    /// the identity missing. A failed insert aborts the remaining chunks.
    /// A record's own `id` is stored as `source_id`; record ids are assigned by the store.
    #[instrument(skip_all, fields(collection = %destination.settings.collection, records = records.len()))]
    pub async fn upsert_batch(
        &self,
        destination: &DestinationHandle,
        records: Vec<Value>,
    ) -> Result<UpsertSummary, AppError> {
        let settings = &destination.settings;
        let received = records.len();
        if received == 0 {
            debug!("Empty batch; nothing to upsert");
            return Ok(UpsertSummary::default());
        }

        let records = dedupe_by_identity(records, settings)?;
        let identities: Vec<String> = records
            .iter()
            .filter_map(|record| record.get(IDENTITY_FIELD).and_then(Value::as_str))
            .map(ToString::to_string)
            .collect();

        let superseded = delete_existing(destination, identities).await?;

        let mut chunks = 0;
        for chunk in records.chunks(settings.batch_size.max(1)) {
            insert_chunk(destination, chunk.to_vec()).await?;
            chunks += 1;
        }

        ensure_vector_index(
            destination.db.as_ref(),
            &settings.index_descriptor(),
            &self.index_policy,
        )
        .await?;

        let summary = UpsertSummary {
            received,
            written: records.len(),
            superseded,
            chunks,
        };
        info!(
            received = summary.received,
            written = summary.written,
            superseded = summary.superseded,
            chunks = summary.chunks,
            "Upserted batch"
        );
        Ok(summary)
    }
}

fn check_embedding(record: &Value, settings: &DestinationSettings) -> Result<(), String> {
    if !record.is_object() {
        return Err("record is not a JSON object".to_string());
    }
    let embedding = lookup_path(record, &settings.embedding_path)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("no embedding array at '{}'", settings.embedding_path))?;

    if embedding.len() != settings.embedding_dimensions {
        return Err(format!(
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            settings.embedding_dimensions
        ));
    }
    if !embedding.iter().all(Value::is_number) {
        return Err("embedding contains non-numeric values".to_string());
    }
    Ok(())
}

/// Attach identities and collapse records sharing one: the later record wins but
/// keeps the position of the first occurrence.
fn dedupe_by_identity(
    records: Vec<Value>,
    settings: &DestinationSettings,
) -> Result<Vec<Value>, AppError> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<Value> = Vec::with_capacity(records.len());

    for (position, mut record) in records.into_iter().enumerate() {
        check_embedding(&record, settings)
            .map_err(|reason| AppError::Upsert(format!("record {position}: {reason}")))?;

        let identity = identity_of(&record, &settings.id_fields, settings.hash_identity);
        if let Value::Object(map) = &mut record {
            if let Some(source_id) = map.remove("id") {
                map.entry(SOURCE_ID_FIELD.to_string()).or_insert(source_id);
            }
            map.insert(IDENTITY_FIELD.to_string(), Value::String(identity.clone()));
        }

        match positions.get(&identity) {
            Some(&existing) => {
                debug!(%identity, "Duplicate identity in batch; keeping the later record");
                if let Some(slot) = unique.get_mut(existing) {
                    *slot = record;
                }
            }
            None => {
                positions.insert(identity, unique.len());
                unique.push(record);
            }
        }
    }

    Ok(unique)
}

async fn delete_existing(
    destination: &DestinationHandle,
    identities: Vec<String>,
) -> Result<usize, AppError> {
    let table = destination.settings.collection.clone();

    let mut found = destination
        .db
        .client
        .query("SELECT VALUE doc_id FROM type::table($table) WHERE doc_id IN $ids")
        .bind(("table", table.clone()))
        .bind(("ids", identities))
        .await?;
    let mut existing: Vec<String> = found.take(0)?;
    existing.sort_unstable();
    existing.dedup();

    if existing.is_empty() {
        return Ok(0);
    }

    debug!(count = existing.len(), %table, "Deleting superseded records");
    destination
        .db
        .client
        .query("DELETE type::table($table) WHERE doc_id IN $ids RETURN NONE")
        .bind(("table", table))
        .bind(("ids", existing.clone()))
        .await?
        .check()?;

    Ok(existing.len())
}

async fn insert_chunk(destination: &DestinationHandle, chunk: Vec<Value>) -> Result<(), AppError> {
    // The collection name was validated as a plain identifier.
    let statement = format!(
        "INSERT INTO {} $records RETURN NONE",
        destination.settings.collection
    );
    let size = chunk.len();

    destination
        .db
        .client
        .query(statement)
        .bind(("records", chunk))
        .await
        .and_then(|response| response.check())
        .map_err(|e| {
            AppError::Upsert(format!(
                "bulk insert of {size} records into {} failed: {e}",
                destination.settings.collection
            ))
        })?;

    Ok(())
}
