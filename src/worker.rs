use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::queue::JobQueue;
use crate::runner;
use crate::slots::SlotPool;

/// Polling cadence; short next to job durations of seconds to a minute.
const TICK: Duration = Duration::from_millis(300);
/// How long one dispatch attempt waits for a slot before requeueing.
const RESERVE_TIMEOUT: Duration = Duration::from_secs(1);

/// The single coordinator pairing queued jobs with free sandbox slots.
/// Exits on cancellation; in-flight runners finish under their own
/// deadlines.
pub async fn worker_loop(
    slots: Arc<SlotPool>,
    queue: Arc<JobQueue>,
    db_pool: Arc<SqlitePool>,
    config: Arc<Config>,
    token: CancellationToken,
) {
    log::info!(
        "worker loop initialized with {} sandbox slots",
        slots.capacity()
    );

    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("worker loop received shutdown signal, stopping");
                break;
            }

            _ = tick.tick() => {
                dispatch(&slots, &queue, &db_pool, &config).await;
            }
        }
    }

    log::info!("worker loop has shut down gracefully");
}

async fn dispatch(
    slots: &Arc<SlotPool>,
    queue: &Arc<JobQueue>,
    db_pool: &Arc<SqlitePool>,
    config: &Arc<Config>,
) {
    while slots.available() > 0 && !queue.is_empty() {
        let Some(job) = queue.try_pop() else {
            break;
        };

        match slots.reserve(RESERVE_TIMEOUT).await {
            Some(slot) => {
                log::info!(
                    "submission {} dispatched to box {}",
                    job.submission_id,
                    slot.box_id()
                );
                tokio::spawn(runner::run_job(
                    job,
                    slot,
                    Arc::clone(db_pool),
                    Arc::clone(queue),
                    Arc::clone(config),
                ));
            }
            // back to the tail; the next tick retries
            None => queue.push(job),
        }
    }
}
