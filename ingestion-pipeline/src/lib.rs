#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod identity;
pub mod pipeline;
pub mod registration;
pub mod scheduler;
pub mod upsert;

use chrono::Utc;
pub use pipeline::{PipelineRunner, StagedRecordRunner};
pub use registration::SourceRegistry;
pub use scheduler::{SchedulePolicy, Scheduler, TickSummary};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
pub use upsert::{UpsertEngine, UpsertSummary};

/// Drive `scheduler` every `tick_every` until `shutdown` fires.
///
/// Ticks never overlap: a tick that outlasts the period pushes the next one back.
/// A tick already in progress is allowed to finish before the loop returns.
pub async fn run_scheduler_loop(
    scheduler: Arc<Scheduler>,
    tick_every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(tick_secs = tick_every.as_secs(), "Scheduler loop started");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Scheduler loop stopping");
                break;
            }
            _ = ticker.tick() => {
                match scheduler.tick(Utc::now()).await {
                    Ok(summary) if summary.started > 0 => info!(
                        examined = summary.examined,
                        started = summary.started,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        written = summary.written,
                        "Scheduler tick finished"
                    ),
                    Ok(summary) => debug!(examined = summary.examined, "Nothing due"),
                    Err(err) => error!(error = %err, "Scheduler tick failed"),
                }
            }
        }
    }
}
