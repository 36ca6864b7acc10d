//! Configuration for a registered source, from raw registration payload to the
//! validated, immutable [`PipelineConfig`] that flows to the pipeline runner.
//!
//! Validation happens once, in [`PipelineConfig::from_request`]. Source types are
//! resolved into the closed [`SourceSpec`] set at that point; nothing downstream
//! matches on type strings again.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{error::AppError, storage::indexes::VectorIndexDescriptor};

/// Interval used when a registration omits `sync_interval_seconds`; effectively "run once".
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10_000_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_INDEX_NAME: &str = "default";
pub const DEFAULT_EMBEDDING_PATH: &str = "embeddings";
pub const DEFAULT_NAMESPACE: &str = "ingest";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sync_interval_seconds: Option<u64>,
    pub source: RawSourceConfig,
    pub destination: RawDestinationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawSourceConfig {
    pub source_type: String,
    #[serde(default)]
    pub credentials: Option<HashMap<String, String>>,
    #[serde(default)]
    pub params: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawDestinationConfig {
    pub uri: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub database: String,
    pub collection: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_embedding_path")]
    pub embedding_path: String,
    #[serde(default)]
    pub embedding_dimensions: Option<usize>,
    #[serde(default = "default_id_fields")]
    pub id_fields: Vec<String>,
    #[serde(default, alias = "create_md5")]
    pub hash_identity: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

fn default_embedding_path() -> String {
    DEFAULT_EMBEDDING_PATH.to_string()
}

fn default_id_fields() -> Vec<String> {
    vec!["text".to_string()]
}

/// Chunking parameters handed through to the pipeline's chunking stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingParams {
    pub strategy: String,
    pub max_characters: usize,
    pub overlap: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            strategy: "by_title".to_string(),
            max_characters: 1500,
            overlap: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum SourceSpec {
    Local {
        path: String,
        chunking: ChunkingParams,
    },
    S3 {
        remote_url: String,
        credentials: Option<S3Credentials>,
        chunking: ChunkingParams,
    },
    GoogleDrive {
        drive_id: String,
        service_account_key: String,
        chunking: ChunkingParams,
    },
}

impl SourceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::Local { .. } => "local",
            SourceSpec::S3 { .. } => "s3",
            SourceSpec::GoogleDrive { .. } => "google_drive",
        }
    }

    fn from_raw(raw: RawSourceConfig) -> Result<Self, AppError> {
        let params = raw.params.ok_or_else(|| {
            AppError::ConfigValidation("source configuration params not provided".into())
        })?;
        let chunking = chunking_from_params(&params)?;
        let credentials = raw.credentials.unwrap_or_default();

        match raw.source_type.as_str() {
            "local" => {
                let path = string_param(&params, "input_path")
                    .or_else(|| string_param(&params, "path"))
                    .ok_or_else(|| {
                        AppError::ConfigValidation(
                            "local source requires params.input_path".into(),
                        )
                    })?;
                Ok(SourceSpec::Local { path, chunking })
            }
            "s3" => {
                let remote_url = string_param(&params, "remote_url").ok_or_else(|| {
                    AppError::ConfigValidation("s3 source requires params.remote_url".into())
                })?;
                let parsed = Url::parse(&remote_url).map_err(|e| {
                    AppError::ConfigValidation(format!("invalid s3 remote_url {remote_url}: {e}"))
                })?;
                if parsed.scheme() != "s3" || parsed.host_str().map_or(true, str::is_empty) {
                    return Err(AppError::ConfigValidation(format!(
                        "s3 remote_url must look like s3://bucket/prefix, got {remote_url}"
                    )));
                }

                let credentials = match (
                    credentials.get("aws_access_key_id"),
                    credentials.get("aws_secret_access_key"),
                ) {
                    (Some(key), Some(secret)) => Some(S3Credentials {
                        access_key_id: key.clone(),
                        secret_access_key: secret.clone(),
                        session_token: credentials.get("aws_session_token").cloned(),
                    }),
                    (None, None) => None,
                    _ => {
                        return Err(AppError::ConfigValidation(
                            "s3 credentials need both aws_access_key_id and aws_secret_access_key"
                                .into(),
                        ))
                    }
                };

                Ok(SourceSpec::S3 {
                    remote_url,
                    credentials,
                    chunking,
                })
            }
            "google_drive" => {
                let drive_id = credentials
                    .get("google_drive_folder_id")
                    .cloned()
                    .ok_or_else(|| {
                        AppError::ConfigValidation(
                            "google_drive source requires credentials.google_drive_folder_id"
                                .into(),
                        )
                    })?;
                let service_account_key = credentials
                    .get("gcp_service_account_key_string")
                    .cloned()
                    .ok_or_else(|| {
                        AppError::ConfigValidation(
                            "google_drive source requires credentials.gcp_service_account_key_string"
                                .into(),
                        )
                    })?;
                Ok(SourceSpec::GoogleDrive {
                    drive_id,
                    service_account_key,
                    chunking,
                })
            }
            other => Err(AppError::ConfigValidation(format!(
                "unsupported source type: {other}"
            ))),
        }
    }
}

fn string_param(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn usize_param(params: &HashMap<String, Value>, key: &str) -> Result<Option<usize>, AppError> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };

    let parsed = match value {
        Value::Number(number) => number.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(text) => text.trim().parse::<usize>().ok(),
        _ => None,
    };

    parsed
        .map(Some)
        .ok_or_else(|| AppError::ConfigValidation(format!("{key} must be a non-negative integer")))
}

fn chunking_from_params(params: &HashMap<String, Value>) -> Result<ChunkingParams, AppError> {
    let defaults = ChunkingParams::default();
    let chunking = ChunkingParams {
        strategy: string_param(params, "chunking_strategy").unwrap_or(defaults.strategy),
        max_characters: usize_param(params, "chunk_max_characters")?
            .unwrap_or(defaults.max_characters),
        overlap: usize_param(params, "chunk_overlap")?.unwrap_or(defaults.overlap),
    };

    if chunking.max_characters == 0 {
        return Err(AppError::ConfigValidation(
            "chunk_max_characters must be > 0".into(),
        ));
    }
    if chunking.overlap >= chunking.max_characters {
        return Err(AppError::ConfigValidation(
            "chunk_overlap must be smaller than chunk_max_characters".into(),
        ));
    }

    Ok(chunking)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationCredentials {
    pub username: String,
    pub password: String,
}

/// Validated destination: where records land and how they are keyed and indexed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationSettings {
    pub address: String,
    pub credentials: Option<DestinationCredentials>,
    pub namespace: String,
    pub database: String,
    pub collection: String,
    pub index_name: String,
    pub embedding_path: String,
    pub embedding_dimensions: usize,
    pub id_fields: Vec<String>,
    pub hash_identity: bool,
    pub batch_size: usize,
}

impl DestinationSettings {
    fn from_raw(raw: RawDestinationConfig) -> Result<Self, AppError> {
        if raw.uri.trim().is_empty() {
            return Err(AppError::ConfigValidation("destination uri is required".into()));
        }
        if raw.database.trim().is_empty() || raw.namespace.trim().is_empty() {
            return Err(AppError::ConfigValidation(
                "destination namespace and database are required".into(),
            ));
        }
        ensure_identifier("destination collection", &raw.collection)?;
        ensure_identifier("destination index_name", &raw.index_name)?;
        for segment in raw.embedding_path.split('.') {
            ensure_identifier("destination embedding_path", segment)?;
        }

        let embedding_dimensions = match raw.embedding_dimensions {
            Some(dimensions) if dimensions > 0 => dimensions,
            _ => {
                return Err(AppError::ConfigValidation(
                    "destination embedding_dimensions must be > 0".into(),
                ))
            }
        };

        let id_fields: Vec<String> = raw
            .id_fields
            .into_iter()
            .map(|field| field.trim().to_string())
            .filter(|field| !field.is_empty())
            .collect();
        if id_fields.is_empty() {
            return Err(AppError::ConfigValidation(
                "destination id_fields must name at least one field".into(),
            ));
        }

        let batch_size = raw.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(AppError::ConfigValidation(
                "destination batch_size must be > 0".into(),
            ));
        }

        let credentials = match (raw.username, raw.password) {
            (Some(username), Some(password)) => Some(DestinationCredentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(AppError::ConfigValidation(
                    "destination username and password must be given together".into(),
                ))
            }
        };

        Ok(Self {
            address: raw.uri.trim().to_string(),
            credentials,
            namespace: raw.namespace,
            database: raw.database,
            collection: raw.collection,
            index_name: raw.index_name,
            embedding_path: raw.embedding_path,
            embedding_dimensions,
            id_fields,
            hash_identity: raw.hash_identity,
            batch_size,
        })
    }

    pub fn index_descriptor(&self) -> VectorIndexDescriptor {
        VectorIndexDescriptor {
            name: self.index_name.clone(),
            table: self.collection.clone(),
            field: self.embedding_path.clone(),
            dimension: self.embedding_dimensions,
        }
    }
}

/// Names interpolated into SurrealQL must be plain identifiers.
fn ensure_identifier(label: &str, value: &str) -> Result<(), AppError> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(AppError::ConfigValidation(format!(
            "{label} must be an identifier ([A-Za-z_][A-Za-z0-9_]*), got {value:?}"
        )))
    }
}

/// Immutable, validated configuration for one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    pub name: Option<String>,
    pub source: SourceSpec,
    pub destination: DestinationSettings,
    pub sync_interval_seconds: u64,
}

impl PipelineConfig {
    pub fn from_request(request: RegistrationRequest) -> Result<Self, AppError> {
        let source = SourceSpec::from_raw(request.source)?;
        let destination = DestinationSettings::from_raw(request.destination)?;
        let sync_interval_seconds = match request.sync_interval_seconds {
            Some(0) | None => DEFAULT_SYNC_INTERVAL_SECS,
            Some(seconds) => seconds,
        };
        let name = request
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(Self {
            name,
            source,
            destination,
            sync_interval_seconds,
        })
    }

    /// Parse and validate an untyped registration payload.
    pub fn from_json(payload: Value) -> Result<Self, AppError> {
        let request: RegistrationRequest = serde_json::from_value(payload)
            .map_err(|e| AppError::ConfigValidation(format!("malformed registration: {e}")))?;
        Self::from_request(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "source": {
                "source_type": "s3",
                "credentials": {
                    "aws_access_key_id": "AKIA",
                    "aws_secret_access_key": "secret"
                },
                "params": {
                    "remote_url": "s3://bucket/staged",
                    "chunk_max_characters": "1200",
                    "chunk_overlap": 50
                }
            },
            "destination": {
                "uri": "ws://localhost:8000",
                "database": "docs",
                "collection": "chunks",
                "embedding_dimensions": 384,
                "id_fields": ["metadata.data_source.url"],
                "create_md5": true
            }
        })
    }

    #[test]
    fn applies_defaults_and_resolves_source_variant() {
        let config = PipelineConfig::from_json(payload()).expect("valid config");

        assert_eq!(config.sync_interval_seconds, DEFAULT_SYNC_INTERVAL_SECS);
        assert_eq!(config.source.kind(), "s3");
        match &config.source {
            SourceSpec::S3 {
                credentials,
                chunking,
                ..
            } => {
                assert_eq!(chunking.max_characters, 1200);
                assert_eq!(chunking.overlap, 50);
                assert_eq!(chunking.strategy, "by_title");
                let credentials = credentials.as_ref().expect("credentials");
                assert_eq!(credentials.access_key_id, "AKIA");
                assert!(credentials.session_token.is_none());
            }
            other => panic!("unexpected source {other:?}"),
        }

        let destination = &config.destination;
        assert_eq!(destination.namespace, DEFAULT_NAMESPACE);
        assert_eq!(destination.index_name, DEFAULT_INDEX_NAME);
        assert_eq!(destination.embedding_path, DEFAULT_EMBEDDING_PATH);
        assert_eq!(destination.batch_size, DEFAULT_BATCH_SIZE);
        assert!(destination.hash_identity);
        assert!(destination.credentials.is_none());

        let descriptor = destination.index_descriptor();
        assert_eq!(descriptor.table, "chunks");
        assert_eq!(descriptor.field, "embeddings");
        assert_eq!(descriptor.dimension, 384);
    }

    #[test]
    fn zero_interval_falls_back_to_sentinel() {
        let mut raw = payload();
        raw["sync_interval_seconds"] = json!(0);
        let config = PipelineConfig::from_json(raw).expect("valid config");
        assert_eq!(config.sync_interval_seconds, DEFAULT_SYNC_INTERVAL_SECS);

        let mut raw = payload();
        raw["sync_interval_seconds"] = json!(3600);
        let config = PipelineConfig::from_json(raw).expect("valid config");
        assert_eq!(config.sync_interval_seconds, 3600);
    }

    #[test]
    fn rejects_unknown_source_type() {
        let mut raw = payload();
        raw["source"]["source_type"] = json!("ftp");
        let err = PipelineConfig::from_json(raw).expect_err("should fail");
        assert!(matches!(err, AppError::ConfigValidation(msg) if msg.contains("ftp")));
    }

    #[test]
    fn rejects_missing_params() {
        let mut raw = payload();
        raw["source"]
            .as_object_mut()
            .expect("object")
            .remove("params");
        assert!(matches!(
            PipelineConfig::from_json(raw),
            Err(AppError::ConfigValidation(_))
        ));
    }

    #[test]
    fn rejects_non_s3_remote_url() {
        let mut raw = payload();
        raw["source"]["params"]["remote_url"] = json!("https://bucket/staged");
        assert!(matches!(
            PipelineConfig::from_json(raw),
            Err(AppError::ConfigValidation(_))
        ));
    }

    #[test]
    fn rejects_bad_destination_values() {
        let cases = [
            ("embedding_dimensions", json!(0)),
            ("batch_size", json!(0)),
            ("id_fields", json!([])),
            ("collection", json!("chunks; REMOVE TABLE x")),
            ("embedding_path", json!("meta..vector")),
        ];

        for (field, value) in cases {
            let mut raw = payload();
            raw["destination"][field] = value;
            let result = PipelineConfig::from_json(raw);
            assert!(
                matches!(result, Err(AppError::ConfigValidation(_))),
                "{field} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_malformed_payload() {
        let result = PipelineConfig::from_json(json!({ "source": "nope" }));
        assert!(matches!(result, Err(AppError::ConfigValidation(_))));
    }

    #[test]
    fn local_and_drive_sources_validate_their_own_fields() {
        let mut raw = payload();
        raw["source"] = json!({
            "source_type": "local",
            "params": { "input_path": "/data/staged" }
        });
        let config = PipelineConfig::from_json(raw).expect("local config");
        assert_eq!(
            config.source,
            SourceSpec::Local {
                path: "/data/staged".into(),
                chunking: ChunkingParams::default(),
            }
        );

        let mut raw = payload();
        raw["source"] = json!({
            "source_type": "google_drive",
            "credentials": { "google_drive_folder_id": "folder" },
            "params": {}
        });
        assert!(matches!(
            PipelineConfig::from_json(raw),
            Err(AppError::ConfigValidation(msg)) if msg.contains("gcp_service_account_key_string")
        ));
    }

    #[test]
    fn source_round_trips_through_tagged_representation() {
        let config = PipelineConfig::from_json(payload()).expect("valid config");
        let stored = serde_json::to_value(&config.source).expect("serialize");
        assert_eq!(stored["source_type"], json!("s3"));
    }
}
