//! Deterministic record identities used to deduplicate upserts across runs.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Field written onto every record carrying its computed identity.
pub const IDENTITY_FIELD: &str = "doc_id";

const SEPARATOR: &str = "_";

/// Resolve a dot-separated path against nested objects.
pub fn lookup_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.get(segment))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Identity of `record` derived from the values at `id_fields`, in order.
///
/// Missing paths and `null` values contribute nothing; zero, `""` and `false` do.
/// With `hash` set the joined key is replaced by its lowercase hex SHA-256 digest.
pub fn identity_of(record: &Value, id_fields: &[String], hash: bool) -> String {
    let key = id_fields
        .iter()
        .filter_map(|field| lookup_path(record, field))
        .filter(|value| !value.is_null())
        .map(stringify)
        .collect::<Vec<_>>()
        .join(SEPARATOR);

    if hash {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    } else {
        key
    }
}
