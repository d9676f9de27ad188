//! Job runner: drives a job's tasks through their drivers with bounded
//! concurrency, aggregates the summary, and honors cooperative
//! cancellation.
//!
//! Tasks are scheduled in roughly submission order, but parallel execution
//! is unordered; the only cross-task guarantee is that summary updates are
//! serialized per job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use autodev_db::models::{JobStatus, TaskStatus};
use autodev_db::queries::jobs as job_db;
use autodev_db::queries::tasks as task_db;

use crate::coalesce::BatchCoalescer;
use crate::driver::TaskDriver;
use crate::error::{FailureCode, TaskFailure};
use crate::host::SourceHost;
use crate::state::dispatch;
use crate::store;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Maximum number of concurrently driven tasks.
    pub max_parallel: usize,
    /// Keep scheduling after a task fails. When false, the first failure
    /// stops the job.
    pub continue_on_error: bool,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            continue_on_error: true,
        }
    }
}

/// Result of running a job to quiescence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every task completed.
    Completed,
    /// Mixed completed/failed with `continue_on_error`.
    Partial { failed_tasks: Vec<Uuid> },
    /// A task failed and `continue_on_error` is off, or every task failed.
    Failed { failed_tasks: Vec<Uuid> },
    /// One or more tasks are suspended awaiting an external event
    /// (batch processing, check conclusion, or a human merge). The job
    /// stays `running`; a later ingress event resumes it.
    AwaitingExternal { suspended_tasks: Vec<Uuid> },
    /// The cancellation token fired. In-flight drivers were drained and
    /// every remaining non-terminal member (unstarted or suspended) was
    /// failed with `CANCELLED`, so the frozen summary shows no work in
    /// progress.
    Cancelled,
}

/// Message sent from spawned driver tasks back to the runner loop.
struct DriveDone {
    task_id: Uuid,
    result: Result<TaskStatus>,
}

/// Run a job to quiescence.
///
/// Schedules task drivers up to `max_parallel` concurrently, updates the
/// job summary as tasks settle, processes due batches between rounds, and
/// resolves the job's terminal status.
pub async fn run_job(
    pool: &PgPool,
    job_id: Uuid,
    driver: Arc<TaskDriver>,
    coalescer: Arc<BatchCoalescer>,
    host: Arc<dyn SourceHost>,
    config: &JobRunnerConfig,
    cancel: CancellationToken,
) -> Result<JobOutcome> {
    let job = job_db::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    match job.status {
        JobStatus::Pending => {
            job_db::transition_job_status(pool, job_id, JobStatus::Pending, JobStatus::Running)
                .await?;
        }
        JobStatus::Running => {}
        other => anyhow::bail!("job {job_id} has status {other}, expected pending or running"),
    }

    let semaphore = Arc::new(Semaphore::new(config.max_parallel));
    let (tx, mut rx) = mpsc::channel::<DriveDone>(config.max_parallel * 2);
    let mut in_flight: usize = 0;
    // Tasks with a live driver. A task can be re-driven after suspension
    // (a failed batch reactivates its members), so this tracks the present,
    // not history.
    let mut in_flight_ids: HashSet<Uuid> = HashSet::new();
    let mut stop_scheduling = false;

    loop {
        // Cancellation: stop accepting new tasks, drain in-flight drivers
        // (they observe the token at their next stage boundary), then fail
        // whatever never ran.
        if cancel.is_cancelled() {
            tracing::info!(job_id = %job_id, "job cancelled, draining in-flight tasks");
            while in_flight > 0 {
                match rx.recv().await {
                    Some(done) => {
                        in_flight -= 1;
                        log_drive_result(&done);
                        settle_driver_error(pool, &done).await;
                    }
                    None => break,
                }
            }
            fail_open_tasks(pool, job_id).await?;
            store::refresh_job_summary(pool, job_id).await?;
            job_db::transition_job_status(pool, job_id, JobStatus::Running, JobStatus::Cancelled)
                .await?;
            return Ok(JobOutcome::Cancelled);
        }

        // Drain completed results (non-blocking) and refresh the summary.
        let mut settled_any = false;
        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            in_flight_ids.remove(&done.task_id);
            settled_any = true;
            log_drive_result(&done);
            settle_driver_error(pool, &done).await;
            if matches!(done.result, Ok(TaskStatus::Failed) | Err(_)) && !config.continue_on_error
            {
                stop_scheduling = true;
            }
        }
        if settled_any {
            store::refresh_job_summary(pool, job_id).await?;
        }

        // Give due batches a chance to combine and open their PR.
        let processed = coalescer.process_due(host.as_ref()).await?;
        if !processed.is_empty() {
            store::refresh_job_summary(pool, job_id).await?;
        }

        // Check termination: nothing in flight and nothing schedulable.
        let tasks = task_db::list_tasks_for_job(pool, job_id).await?;
        let schedulable: Vec<Uuid> = if stop_scheduling {
            Vec::new()
        } else {
            tasks
                .iter()
                .filter(|t| !t.status.is_terminal() && !t.status.is_suspension())
                .filter(|t| !in_flight_ids.contains(&t.id))
                .map(|t| t.id)
                .collect()
        };

        if in_flight == 0 && schedulable.is_empty() {
            let suspended: Vec<Uuid> = tasks
                .iter()
                .filter(|t| t.status.is_suspension())
                .map(|t| t.id)
                .collect();
            if !suspended.is_empty() && !stop_scheduling {
                // Leave the job running; ingress events resume it.
                store::refresh_job_summary(pool, job_id).await?;
                return Ok(JobOutcome::AwaitingExternal {
                    suspended_tasks: suspended,
                });
            }

            if stop_scheduling {
                fail_open_tasks(pool, job_id).await?;
            }
            let summary = store::refresh_job_summary(pool, job_id).await?;
            let failed_tasks: Vec<Uuid> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id)
                .collect();

            let (to_status, outcome) = if summary.failed == 0 {
                (JobStatus::Completed, JobOutcome::Completed)
            } else if !config.continue_on_error || summary.completed == 0 {
                (JobStatus::Failed, JobOutcome::Failed { failed_tasks })
            } else {
                (JobStatus::Partial, JobOutcome::Partial { failed_tasks })
            };
            job_db::transition_job_status(pool, job_id, JobStatus::Running, to_status).await?;
            return Ok(outcome);
        }

        // Spawn schedulable tasks, bounded by the free worker slots so the
        // loop never blocks on a permit.
        let slots = semaphore.available_permits();
        let to_spawn: Vec<Uuid> = schedulable.iter().copied().take(slots).collect();
        let spawned_any = !to_spawn.is_empty();
        for task_id in to_spawn {
            let permit = semaphore.clone().acquire_owned().await?;
            let driver = Arc::clone(&driver);
            let tx = tx.clone();
            let cancel = cancel.clone();

            in_flight_ids.insert(task_id);
            in_flight += 1;

            tokio::spawn(async move {
                let result = driver.run_task(task_id, &cancel).await;
                drop(permit);
                let _ = tx.send(DriveDone { task_id, result }).await;
            });
        }

        // Wait for a result or cancellation when there is nothing new to
        // spawn.
        if in_flight > 0 {
            tokio::select! {
                done = rx.recv() => {
                    if let Some(done) = done {
                        in_flight -= 1;
                        in_flight_ids.remove(&done.task_id);
                        log_drive_result(&done);
                        settle_driver_error(pool, &done).await;
                        if matches!(done.result, Ok(TaskStatus::Failed) | Err(_))
                            && !config.continue_on_error
                        {
                            stop_scheduling = true;
                        }
                        store::refresh_job_summary(pool, job_id).await?;
                    }
                }
                _ = cancel.cancelled() => {
                    // Handled at the top of the next iteration.
                    continue;
                }
            }
        } else if !spawned_any {
            // Nothing in flight, nothing spawned: brief sleep before
            // re-checking (a batch may become due).
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = cancel.cancelled() => {
                    continue;
                }
            }
        }
    }
}

fn log_drive_result(done: &DriveDone) {
    match &done.result {
        Ok(status) => {
            tracing::info!(task_id = %done.task_id, status = %status, "task driver returned");
        }
        Err(e) => {
            tracing::error!(task_id = %done.task_id, error = %e, "task driver failed");
        }
    }
}

/// A driver that aborted with an error leaves its task mid-state; settle
/// it to `failed` so the job can resolve. Best-effort.
async fn settle_driver_error(pool: &PgPool, done: &DriveDone) {
    let Err(e) = &done.result else { return };
    let failure = TaskFailure::new(FailureCode::Store, "task driver aborted")
        .with_cause(format!("{e:#}"))
        .recoverable();
    if let Err(err) = dispatch::fail_task(pool, done.task_id, &failure).await {
        tracing::warn!(task_id = %done.task_id, error = %err, "failed to settle aborted task");
    }
}

/// Fail every non-terminal member the runner will no longer drive:
/// tasks that never started and tasks parked in a suspension state.
///
/// A job's cancellation (or stop-on-error) is a terminal decision for
/// all of its members. Leaving a suspended task behind would keep the
/// frozen job's summary showing work in progress, and a later webhook
/// could walk the task to `completed` and mutate a cancelled job after
/// the fact. An already-opened pull request stays open for humans; the
/// task itself settles as failed with `CANCELLED` (operator-retryable).
async fn fail_open_tasks(pool: &PgPool, job_id: Uuid) -> Result<()> {
    let tasks = task_db::list_tasks_for_job(pool, job_id).await?;
    for task in tasks {
        if task.status.is_terminal() {
            continue;
        }
        let failure =
            TaskFailure::new(FailureCode::Cancelled, "job stopped before task finished")
                .recoverable();
        dispatch::fail_task(pool, task.id, &failure).await?;
    }
    Ok(())
}
