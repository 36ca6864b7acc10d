use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::{
    pipeline_config::{DestinationSettings, PipelineConfig, SourceSpec},
    run_timestamp,
};

pub const DEFAULT_LEASE_SECS: i64 = 3600;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Running,
    #[default]
    Completed,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Running => "running",
            SourceStatus::Completed => "completed",
            SourceStatus::Failed => "failed",
        }
    }
}

/// How a caller names the entry it wants removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    Id(String),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTransition {
    Start,
    Complete,
    Fail,
    /// Take over a `running` entry whose lease went stale.
    Reclaim,
}

impl SourceTransition {
    fn as_str(self) -> &'static str {
        match self {
            SourceTransition::Start => "start",
            SourceTransition::Complete => "complete",
            SourceTransition::Fail => "fail",
            SourceTransition::Reclaim => "reclaim",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: SourceLifecycleMachine,
        initial: Completed,
        states: [Completed, Running, Failed],
        events {
            start {
                transition: { from: Completed, to: Running }
                transition: { from: Failed, to: Running }
            }
            complete {
                transition: { from: Running, to: Completed }
            }
            fail {
                transition: { from: Running, to: Failed }
            }
        }
    }

    pub(super) fn completed() -> SourceLifecycleMachine<(), Completed> {
        SourceLifecycleMachine::new(())
    }

    pub(super) fn running() -> Option<SourceLifecycleMachine<(), Running>> {
        completed().start().ok()
    }

    pub(super) fn failed() -> Option<SourceLifecycleMachine<(), Failed>> {
        running().and_then(|machine| machine.fail().ok())
    }
}

fn invalid_transition(state: SourceStatus, event: SourceTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid source transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

pub fn compute_next_state(
    state: SourceStatus,
    event: SourceTransition,
) -> Result<SourceStatus, AppError> {
    use lifecycle::{completed, failed, running};

    let next = match (state, event) {
        (SourceStatus::Completed, SourceTransition::Start) => {
            completed().start().ok().map(|_| SourceStatus::Running)
        }
        (SourceStatus::Failed, SourceTransition::Start) => failed()
            .and_then(|m| m.start().ok())
            .map(|_| SourceStatus::Running),
        (SourceStatus::Running, SourceTransition::Complete) => running()
            .and_then(|m| m.complete().ok())
            .map(|_| SourceStatus::Completed),
        (SourceStatus::Running, SourceTransition::Fail) => running()
            .and_then(|m| m.fail().ok())
            .map(|_| SourceStatus::Failed),
        (SourceStatus::Running, SourceTransition::Reclaim) => Some(SourceStatus::Running),
        _ => None,
    };

    next.ok_or_else(|| invalid_transition(state, event))
}

fn seconds(secs: i64) -> ChronoDuration {
    ChronoDuration::try_seconds(secs).unwrap_or(ChronoDuration::MAX)
}

stored_object!(SourceEntry, "source_entry", {
    name: Option<String>,
    source: SourceSpec,
    destination: DestinationSettings,
    sync_interval_seconds: u64,
    status: SourceStatus,
    #[serde(with = "crate::storage::types::run_timestamp", default)]
    last_run: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    locked_at: Option<DateTime<Utc>>,
    lease_duration_secs: i64,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_error_at: Option<DateTime<Utc>>
});

impl SourceEntry {
    /// A freshly registered source whose first run has just succeeded.
    pub fn new_completed(config: &PipelineConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: config.name.clone(),
            source: config.source.clone(),
            destination: config.destination.clone(),
            sync_interval_seconds: config.sync_interval_seconds,
            status: SourceStatus::Completed,
            last_run: Some(run_timestamp::truncate(now)),
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            error_message: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            name: self.name.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            sync_interval_seconds: self.sync_interval_seconds,
        }
    }

    pub fn sync_interval(&self) -> ChronoDuration {
        seconds(i64::try_from(self.sync_interval_seconds).unwrap_or(i64::MAX))
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.lease_duration_secs).unwrap_or(0))
    }

    /// A `running` entry nobody has heartbeated within its lease.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status != SourceStatus::Running {
            return false;
        }
        match self.locked_at {
            Some(locked_at) => {
                now.signed_duration_since(locked_at) > seconds(self.lease_duration_secs.max(0))
            }
            None => true,
        }
    }

    pub async fn insert(&self, db: &SurrealDbClient) -> Result<SourceEntry, AppError> {
        db.store_item(self.clone())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source entry {} was not stored", self.id)))
    }

    /// Every registered source, oldest first.
    pub async fn list(db: &SurrealDbClient) -> Result<Vec<SourceEntry>, AppError> {
        let mut result = db
            .client
            .query("SELECT * FROM type::table($table) ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .await?;

        let entries: Vec<SourceEntry> = result.take(0)?;
        Ok(entries)
    }

    /// Set `status` and, when given, `last_run`. `last_run` is never cleared here.
    /// The lease is held exactly while the entry is `running`. Returns `None` when
    /// no entry has `id`.
    pub async fn update_status(
        db: &SurrealDbClient,
        id: &str,
        status: SourceStatus,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<Option<SourceEntry>, AppError> {
        const UPDATE_STATUS_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $status,
                last_run = IF $last_run = NONE THEN last_run ELSE $last_run END,
                locked_at = IF $status = $running THEN $now ELSE NONE END,
                updated_at = $now
            RETURN AFTER;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(UPDATE_STATUS_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("status", status.as_str()))
            .bind(("running", SourceStatus::Running.as_str()))
            .bind(("last_run", last_run.as_ref().map(run_timestamp::format)))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<SourceEntry> = result.take(0)?;
        Ok(updated)
    }

    /// Take the lease on this entry for a run. `last_run` is left untouched.
    ///
    /// The write only lands if the stored status still matches what this snapshot
    /// saw, so two schedulers cannot both start the same entry.
    pub async fn mark_running(
        &self,
        db: &SurrealDbClient,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<SourceEntry>, AppError> {
        let event = if self.status == SourceStatus::Running {
            SourceTransition::Reclaim
        } else {
            SourceTransition::Start
        };
        let next = compute_next_state(self.status, event)?;
        debug_assert_eq!(next, SourceStatus::Running);

        const START_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $running,
                locked_at = $now,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            WHERE status = $expected
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(START_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("running", SourceStatus::Running.as_str()))
            .bind(("expected", self.status.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind((
                "lease_secs",
                i64::try_from(lease.as_secs()).unwrap_or(DEFAULT_LEASE_SECS),
            ))
            .await?;

        let updated: Option<SourceEntry> = result.take(0)?;
        Ok(updated)
    }

    /// Record a successful run finishing at `now`.
    pub async fn mark_completed(
        &self,
        db: &SurrealDbClient,
        now: DateTime<Utc>,
    ) -> Result<Option<SourceEntry>, AppError> {
        compute_next_state(self.status, SourceTransition::Complete)?;
        Self::update_status(db, &self.id, SourceStatus::Completed, Some(now)).await
    }

    /// Record a failed run. `last_run` keeps its previous value.
    pub async fn mark_failed(
        db: &SurrealDbClient,
        id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SourceEntry>, AppError> {
        debug_assert!(compute_next_state(SourceStatus::Running, SourceTransition::Fail).is_ok());

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $failed,
                locked_at = NONE,
                error_message = $error_message,
                last_error_at = $now,
                updated_at = $now
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("failed", SourceStatus::Failed.as_str()))
            .bind(("error_message", message.to_string()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<SourceEntry> = result.take(0)?;
        Ok(updated)
    }

    /// Extend the lease of a running entry.
    pub async fn heartbeat(
        db: &SurrealDbClient,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        const HEARTBEAT_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET locked_at = $now, updated_at = $now
            WHERE status = $running
            RETURN NONE;
        "#;

        db.client
            .query(HEARTBEAT_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("running", SourceStatus::Running.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn find_by_name(
        db: &SurrealDbClient,
        name: &str,
    ) -> Result<Option<SourceEntry>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table) WHERE name = $name ORDER BY created_at ASC LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("name", name.to_string()))
            .await?;

        let entry: Option<SourceEntry> = result.take(0)?;
        Ok(entry)
    }

    /// Remove at most one entry. Nothing matching is not an error.
    pub async fn delete(
        db: &SurrealDbClient,
        selector: &SourceSelector,
    ) -> Result<Option<SourceEntry>, AppError> {
        let id = match selector {
            SourceSelector::Id(id) => id.clone(),
            SourceSelector::Name(name) => match Self::find_by_name(db, name).await? {
                Some(entry) => entry.id,
                None => return Ok(None),
            },
        };

        Ok(db.delete_item::<SourceEntry>(&id).await?)
    }
}
