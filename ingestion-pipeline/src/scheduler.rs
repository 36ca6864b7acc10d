use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::source_entry::{SourceEntry, SourceStatus},
    },
    utils::config::AppConfig,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::pipeline::PipelineRunner;

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Treat `failed` entries as due again once their interval has passed.
    pub retry_failed: bool,
    /// Lease taken when an entry starts running.
    pub lease: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            retry_failed: false,
            lease: Duration::from_secs(3600),
        }
    }
}

impl SchedulePolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry_failed: config.retry_failed,
            lease: config.lease_duration(),
        }
    }

    fn heartbeat_every(&self) -> Duration {
        (self.lease / 3).max(MIN_HEARTBEAT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    IntervalElapsed,
    RetryFailed,
    StaleLease,
}

/// The tick's clock advanced by the wall time spent since the tick began.
fn tick_clock(now: DateTime<Utc>, tick_started: Instant) -> DateTime<Utc> {
    now + ChronoDuration::from_std(tick_started.elapsed())
        .unwrap_or_else(|_| ChronoDuration::zero())
}

fn elapsed_since(since: Option<DateTime<Utc>>, now: DateTime<Utc>, entry: &SourceEntry) -> bool {
    since.map_or(true, |at| now.signed_duration_since(at) > entry.sync_interval())
}

/// Whether `entry` should run at `now`, and why.
///
/// A `completed` entry is due once strictly more than its interval has passed
/// since `last_run`. `failed` entries only come back with `retry_failed`, and a
/// `running` entry only once its lease is stale.
pub fn due_reason(
    entry: &SourceEntry,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> Option<DueReason> {
    match entry.status {
        SourceStatus::Completed => {
            elapsed_since(entry.last_run, now, entry).then_some(DueReason::IntervalElapsed)
        }
        SourceStatus::Failed if policy.retry_failed => {
            let reference = entry.last_run.max(entry.last_error_at);
            elapsed_since(reference, now, entry).then_some(DueReason::RetryFailed)
        }
        SourceStatus::Failed => None,
        SourceStatus::Running => entry.lease_expired(now).then_some(DueReason::StaleLease),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub examined: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records written by the successful runs.
    pub written: u64,
}

enum RunOutcome {
    Succeeded(u64),
    Failed,
    /// The entry changed or vanished before it could be claimed.
    Skipped,
}

pub struct Scheduler {
    db: Arc<SurrealDbClient>,
    runner: Arc<dyn PipelineRunner>,
    policy: SchedulePolicy,
}

impl Scheduler {
    pub fn new(
        db: Arc<SurrealDbClient>,
        runner: Arc<dyn PipelineRunner>,
        policy: SchedulePolicy,
    ) -> Self {
        Self { db, runner, policy }
    }

    /// Evaluate every registered source once and run the due ones, one at a time.
    ///
    /// Failures of individual entries are recorded on the entry and never abort
    /// the tick. Only failing to list the entries is an error.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, AppError> {
        let tick_started = Instant::now();
        let entries = SourceEntry::list(&self.db).await?;
        let mut summary = TickSummary {
            examined: entries.len(),
            ..TickSummary::default()
        };

        for entry in entries {
            let Some(reason) = due_reason(&entry, now, &self.policy) else {
                continue;
            };

            let source_id = entry.id.clone();
            match self.run_entry(entry, reason, now, tick_started).await {
                Ok(RunOutcome::Succeeded(written)) => {
                    summary.started += 1;
                    summary.succeeded += 1;
                    summary.written = summary.written.saturating_add(written);
                }
                Ok(RunOutcome::Failed) => {
                    summary.started += 1;
                    summary.failed += 1;
                }
                Ok(RunOutcome::Skipped) => {}
                Err(err) => {
                    error!(%source_id, error = %err, "Failed to record source run");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    #[instrument(skip_all, fields(source_id = %entry.id, reason = ?reason))]
    async fn run_entry(
        &self,
        entry: SourceEntry,
        reason: DueReason,
        now: DateTime<Utc>,
        tick_started: Instant,
    ) -> Result<RunOutcome, AppError> {
        if reason == DueReason::StaleLease {
            warn!(locked_at = ?entry.locked_at, "Reclaiming source with a stale lease");
        }

        let Some(claimed) = entry.mark_running(&self.db, now, self.policy.lease).await? else {
            debug!("Source changed before it could be started; skipping");
            return Ok(RunOutcome::Skipped);
        };
        info!(source_type = claimed.source.kind(), "Starting source run");

        let outcome = self.execute(&claimed).await;
        // Entries run one after another, so a later entry finishes well after `now`.
        let finished_at = tick_clock(now, tick_started);

        match outcome {
            Ok(written) => {
                let updated = SourceEntry::update_status(
                    &self.db,
                    &claimed.id,
                    SourceStatus::Completed,
                    Some(finished_at),
                )
                .await?;
                if updated.is_none() {
                    info!("Source was deleted during its run");
                }
                info!(written, "Source run completed");
                Ok(RunOutcome::Succeeded(written))
            }
            Err(err) => {
                warn!(error = %err, "Source run failed");
                SourceEntry::mark_failed(&self.db, &claimed.id, &err.to_string(), finished_at)
                    .await?;
                Ok(RunOutcome::Failed)
            }
        }
    }

    /// Run the pipeline on its own task, refreshing the lease until it finishes.
    async fn execute(&self, entry: &SourceEntry) -> Result<u64, AppError> {
        let runner = Arc::clone(&self.runner);
        let config = entry.pipeline_config();
        let mut run = tokio::spawn(async move { runner.run(&config).await });

        let period = self.policy.heartbeat_every();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut run => {
                    return joined.unwrap_or_else(|join_err| {
                        Err(AppError::PipelineExecution(format!("pipeline task aborted: {join_err}")))
                    });
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = SourceEntry::heartbeat(&self.db, &entry.id, Utc::now()).await {
                        warn!(error = %err, "Failed to refresh source lease");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use common::storage::types::pipeline_config::{
        ChunkingParams, DestinationSettings, PipelineConfig, SourceSpec,
    };
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn config(name: &str, interval: u64) -> PipelineConfig {
        PipelineConfig {
            name: Some(name.to_string()),
            source: SourceSpec::Local {
                path: format!("/staged/{name}"),
                chunking: ChunkingParams::default(),
            },
            destination: DestinationSettings {
                address: "mem://".to_string(),
                credentials: None,
                namespace: "ingest".to_string(),
                database: "vectors".to_string(),
                collection: "chunk".to_string(),
                index_name: "idx_chunk_embedding".to_string(),
                embedding_path: "embedding".to_string(),
                embedding_dimensions: 3,
                id_fields: vec!["text".to_string()],
                hash_identity: false,
                batch_size: 100,
            },
            sync_interval_seconds: interval,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    async fn memory_db() -> Arc<SurrealDbClient> {
        let database = Uuid::new_v4().to_string();
        Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("in-memory surrealdb"),
        )
    }

    struct ScriptedRunner {
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn failing(names: &[&str]) -> Self {
            Self {
                failing: names.iter().map(ToString::to_string).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PipelineRunner for ScriptedRunner {
        async fn run(&self, config: &PipelineConfig) -> Result<u64, AppError> {
            let name = config.name.clone().unwrap_or_default();
            self.calls.lock().await.push(name.clone());
            if self.failing.contains(&name) {
                return Err(AppError::PipelineExecution(format!("{name} is unreachable")));
            }
            Ok(5)
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl PipelineRunner for PanickingRunner {
        async fn run(&self, _config: &PipelineConfig) -> Result<u64, AppError> {
            panic!("connector crashed");
        }
    }

    #[test]
    fn completed_entry_is_due_strictly_after_interval() {
        let policy = SchedulePolicy::default();
        let entry = SourceEntry::new_completed(&config("docs", 3600), base_time());

        assert_eq!(
            due_reason(&entry, base_time() + secs(3601), &policy),
            Some(DueReason::IntervalElapsed)
        );
        assert_eq!(due_reason(&entry, base_time() + secs(3600), &policy), None);
        assert_eq!(due_reason(&entry, base_time() + secs(3599), &policy), None);
    }

    #[test]
    fn completed_entry_without_last_run_is_due() {
        let mut entry = SourceEntry::new_completed(&config("docs", 3600), base_time());
        entry.last_run = None;
        assert_eq!(
            due_reason(&entry, base_time(), &SchedulePolicy::default()),
            Some(DueReason::IntervalElapsed)
        );
    }

    #[test]
    fn failed_and_running_entries_are_never_due_under_default_policy() {
        let policy = SchedulePolicy::default();
        let mut entry = SourceEntry::new_completed(&config("docs", 60), base_time());
        let much_later = base_time() + secs(86_400);

        entry.status = SourceStatus::Failed;
        assert_eq!(due_reason(&entry, much_later, &policy), None);

        entry.status = SourceStatus::Running;
        entry.locked_at = Some(much_later);
        assert_eq!(due_reason(&entry, much_later + secs(60), &policy), None);
    }

    #[test]
    fn failed_entry_retries_after_interval_when_enabled() {
        let policy = SchedulePolicy {
            retry_failed: true,
            ..SchedulePolicy::default()
        };
        let mut entry = SourceEntry::new_completed(&config("docs", 600), base_time());
        entry.status = SourceStatus::Failed;
        entry.last_error_at = Some(base_time() + secs(1000));

        assert_eq!(due_reason(&entry, base_time() + secs(1500), &policy), None);
        assert_eq!(
            due_reason(&entry, base_time() + secs(1601), &policy),
            Some(DueReason::RetryFailed)
        );
    }

    #[test]
    fn running_entry_with_stale_lease_is_due() {
        let policy = SchedulePolicy::default();
        let mut entry = SourceEntry::new_completed(&config("docs", 10_000_000), base_time());
        entry.status = SourceStatus::Running;
        entry.locked_at = Some(base_time());
        entry.lease_duration_secs = 300;

        assert_eq!(due_reason(&entry, base_time() + secs(300), &policy), None);
        assert_eq!(
            due_reason(&entry, base_time() + secs(301), &policy),
            Some(DueReason::StaleLease)
        );
    }

    #[tokio::test]
    async fn failing_entry_is_recorded_and_tick_continues() {
        let db = memory_db().await;
        let registered = base_time() - secs(7200);

        let mut bad = SourceEntry::new_completed(&config("bad", 3600), registered);
        bad.created_at = registered;
        let mut good = SourceEntry::new_completed(&config("good", 3600), registered);
        good.created_at = registered + secs(1);
        let mut fresh = SourceEntry::new_completed(&config("fresh", 3600), base_time());
        fresh.created_at = registered + secs(2);
        for entry in [&bad, &good, &fresh] {
            entry.insert(&db).await.expect("insert");
        }

        let runner = Arc::new(ScriptedRunner::failing(&["bad"]));
        let scheduler = Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&runner) as Arc<dyn PipelineRunner>,
            SchedulePolicy::default(),
        );

        let summary = scheduler.tick(base_time()).await.expect("tick");
        assert_eq!(
            summary,
            TickSummary {
                examined: 3,
                started: 2,
                succeeded: 1,
                failed: 1,
                written: 5,
            }
        );
        assert_eq!(*runner.calls.lock().await, vec!["bad", "good"]);

        let bad_after: SourceEntry = db
            .get_item(&bad.id)
            .await
            .expect("fetch")
            .expect("bad exists");
        assert_eq!(bad_after.status, SourceStatus::Failed);
        assert_eq!(bad_after.last_run, Some(registered));
        assert_eq!(bad_after.error_message.as_deref(), Some("Pipeline execution failed: bad is unreachable"));
        assert!(bad_after.locked_at.is_none());

        let good_after: SourceEntry = db
            .get_item(&good.id)
            .await
            .expect("fetch")
            .expect("good exists");
        assert_eq!(good_after.status, SourceStatus::Completed);
        let finished = good_after.last_run.expect("completion recorded");
        assert!(finished >= base_time() && finished < base_time() + secs(5));

        // The failed entry stays parked on the next tick.
        let next = scheduler
            .tick(base_time() + secs(7200))
            .await
            .expect("second tick");
        assert_eq!(next.started, 2);
        assert_eq!(*runner.calls.lock().await, vec!["bad", "good", "good", "fresh"]);
    }

    #[tokio::test]
    async fn panicking_runner_marks_entry_failed() {
        let db = memory_db().await;
        let entry = SourceEntry::new_completed(&config("docs", 60), base_time() - secs(120));
        entry.insert(&db).await.expect("insert");

        let scheduler = Scheduler::new(
            Arc::clone(&db),
            Arc::new(PanickingRunner),
            SchedulePolicy::default(),
        );
        let summary = scheduler.tick(base_time()).await.expect("tick");
        assert_eq!(summary.failed, 1);

        let stored: SourceEntry = db
            .get_item(&entry.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.status, SourceStatus::Failed);
    }

    #[tokio::test]
    async fn stale_running_entry_is_reclaimed() {
        let db = memory_db().await;
        let entry = SourceEntry::new_completed(&config("docs", 10_000_000), base_time() - secs(60));
        entry.insert(&db).await.expect("insert");
        entry
            .mark_running(&db, base_time() - secs(7200), Duration::from_secs(600))
            .await
            .expect("mark running")
            .expect("exists");

        let runner = Arc::new(ScriptedRunner::failing(&[]));
        let scheduler = Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&runner) as Arc<dyn PipelineRunner>,
            SchedulePolicy::default(),
        );
        let summary = scheduler.tick(base_time()).await.expect("tick");
        assert_eq!(summary.succeeded, 1);

        let stored: SourceEntry = db
            .get_item(&entry.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.status, SourceStatus::Completed);
        let finished = stored.last_run.expect("completion recorded");
        assert!(finished >= base_time() && finished < base_time() + secs(5));
    }

    struct SlowRunner {
        db: Arc<SurrealDbClient>,
        observed_lock: Mutex<Option<DateTime<Utc>>>,
    }

    #[async_trait]
    impl PipelineRunner for SlowRunner {
        async fn run(&self, config: &PipelineConfig) -> Result<u64, AppError> {
            tokio::time::sleep(Duration::from_millis(1300)).await;
            let name = config.name.clone().unwrap_or_default();
            let entry = SourceEntry::find_by_name(&self.db, &name).await?;
            *self.observed_lock.lock().await = entry.and_then(|e| e.locked_at);
            Ok(1)
        }
    }

    #[tokio::test]
    async fn lease_is_refreshed_while_running() {
        let db = memory_db().await;
        let entry = SourceEntry::new_completed(&config("slow", 60), base_time() - secs(120));
        entry.insert(&db).await.expect("insert");

        let runner = Arc::new(SlowRunner {
            db: Arc::clone(&db),
            observed_lock: Mutex::new(None),
        });
        let scheduler = Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&runner) as Arc<dyn PipelineRunner>,
            SchedulePolicy {
                retry_failed: false,
                lease: Duration::from_secs(3),
            },
        );

        scheduler.tick(base_time()).await.expect("tick");

        let observed = *runner.observed_lock.lock().await;
        let observed = observed.expect("runner saw a lease");
        assert!(observed > base_time(), "heartbeat moved the lease forward");
    }

    struct SleepingRunner(Duration);

    #[async_trait]
    impl PipelineRunner for SleepingRunner {
        async fn run(&self, _config: &PipelineConfig) -> Result<u64, AppError> {
            tokio::time::sleep(self.0).await;
            Ok(1)
        }
    }

    #[tokio::test]
    async fn last_run_records_when_each_run_finished() {
        let db = memory_db().await;
        let registered = base_time() - secs(7200);
        let mut first = SourceEntry::new_completed(&config("first", 3600), registered);
        first.created_at = registered;
        let mut second = SourceEntry::new_completed(&config("second", 3600), registered);
        second.created_at = registered + secs(1);
        for entry in [&first, &second] {
            entry.insert(&db).await.expect("insert");
        }

        let scheduler = Scheduler::new(
            Arc::clone(&db),
            Arc::new(SleepingRunner(Duration::from_millis(1100))),
            SchedulePolicy::default(),
        );
        let summary = scheduler.tick(base_time()).await.expect("tick");
        assert_eq!(summary.succeeded, 2);

        let first_after: SourceEntry = db
            .get_item(&first.id)
            .await
            .expect("fetch")
            .expect("first exists");
        let second_after: SourceEntry = db
            .get_item(&second.id)
            .await
            .expect("fetch")
            .expect("second exists");
        let first_done = first_after.last_run.expect("first completed");
        let second_done = second_after.last_run.expect("second completed");

        assert!(first_done >= base_time() + secs(1));
        // The second run waited behind the first one.
        assert!(second_done >= base_time() + secs(2));
        assert!(second_done > first_done);
    }
}
