//! Task-store access policies shared by the driver and the job runner.
//!
//! Two concerns live here:
//! - Bounded retry with exponential backoff for transient backing-store
//!   errors, surfacing [`OrchestratorError::StorePermanent`] when spent.
//! - Best-effort event appends: a failure to persist an audit event is
//!   logged and swallowed, never interrupting the driver path.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::JobSummary;
use autodev_db::queries::jobs as job_db;
use autodev_db::queries::task_events::{self, NewTaskEvent};
use autodev_db::queries::tasks as task_db;

use crate::error::OrchestratorError;

/// Total attempts for a transient store error (1 initial + 2 retries).
const STORE_ATTEMPTS: u32 = 3;

/// Base delay for the exponential backoff (50ms, 200ms).
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Whether an error chain bottoms out in a transient sqlx failure worth
/// retrying.
fn is_transient(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Io(_))
            | Some(sqlx::Error::PoolTimedOut)
            | Some(sqlx::Error::WorkerCrashed)
    )
}

/// Run a store operation, retrying transient failures with exponential
/// backoff, capped at three attempts. Non-transient errors surface
/// immediately; an exhausted budget surfaces
/// [`OrchestratorError::StorePermanent`].
pub async fn with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt + 1 < STORE_ATTEMPTS => {
                let delay = BACKOFF_BASE * 4u32.pow(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) if is_transient(&err) => {
                return Err(OrchestratorError::StorePermanent(err).into());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Append a task event, best-effort.
///
/// Errors are logged and swallowed so the driver never stalls on the
/// audit trail.
pub async fn append_event(pool: &PgPool, event: &NewTaskEvent) {
    if let Err(e) = task_events::insert_task_event(pool, event).await {
        tracing::warn!(
            task_id = %event.task_id,
            event_type = %event.event_type,
            error = %e,
            "failed to persist task event (best-effort)"
        );
    }
}

/// Recompute a job's summary from the task table and write it, guarded by
/// the `updated_at` read. Retries the read-modify-write a few times when
/// another writer races; summary updates are serialized per job by the
/// guard, so counters never drift.
pub async fn refresh_job_summary(pool: &PgPool, job_id: Uuid) -> Result<JobSummary> {
    for _ in 0..STORE_ATTEMPTS {
        let job = job_db::get_job(pool, job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;

        let progress = task_db::get_job_progress(pool, job_id).await?;
        let tasks = task_db::list_tasks_for_job(pool, job_id).await?;
        let prs_created: Vec<String> = tasks.iter().filter_map(|t| t.pr_url.clone()).collect();

        let summary = JobSummary {
            total: progress.total,
            completed: progress.completed,
            failed: progress.failed,
            in_progress: progress.in_progress,
            pending: progress.pending,
            prs_created,
        };

        let rows = job_db::write_job_summary(pool, job_id, &summary, job.updated_at).await?;
        if rows > 0 {
            return Ok(summary);
        }
        // Lost the race; re-read and try again.
    }
    anyhow::bail!("failed to update summary for job {job_id}: too many concurrent writers");
}
