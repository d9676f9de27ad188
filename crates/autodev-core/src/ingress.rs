//! Ingress: normalizes external events (webhook deliveries, API calls,
//! label triggers) into tasks and jobs, and reawakens suspended tasks.
//!
//! The repo allowlist is enforced here: events for unlisted repos are
//! dropped silently with a counter increment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::{EventType, Job, Task, TaskStatus};
use autodev_db::queries::jobs as job_db;
use autodev_db::queries::task_events::NewTaskEvent;
use autodev_db::queries::tasks::{self as task_db, NewTask};

use crate::settings::OrchestratorSettings;
use crate::state::dispatch;
use crate::store;

/// A normalized event from the source host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceEvent {
    /// An issue was labeled. Carries the label so ingress can tell the
    /// solo trigger from the batch trigger.
    IssueLabeled {
        repo: String,
        issue_number: i32,
        label: String,
        title: String,
        #[serde(default)]
        body: String,
    },
    /// A check run finished on a branch the orchestrator owns.
    CheckRunCompleted {
        repo: String,
        branch: String,
        passed: bool,
    },
    /// A pull request the orchestrator opened was merged.
    PullRequestMerged { repo: String, pr_number: i32 },
}

/// What ingress did with an event.
#[derive(Debug, Clone)]
pub enum IngressOutcome {
    /// A solo task was created.
    TaskCreated(Task),
    /// A task was created and attached to a (possibly new) job.
    TaskAttachedToJob { task: Task, job: Job },
    /// A suspended task was reawakened into `status`.
    TaskResumed { task_id: Uuid, status: TaskStatus },
    /// The repo is not on the allowlist; dropped silently.
    Dropped,
    /// The event matched nothing we track (unknown label, unknown branch
    /// or PR).
    Ignored,
}

/// The ingress normalizer. One instance per process.
pub struct Ingress {
    pool: PgPool,
    settings: Arc<OrchestratorSettings>,
    dropped: AtomicU64,
}

impl Ingress {
    pub fn new(pool: PgPool, settings: Arc<OrchestratorSettings>) -> Self {
        Self {
            pool,
            settings,
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of events dropped by the allowlist since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Normalize one event into task/job mutations.
    pub async fn handle(&self, event: SourceEvent) -> Result<IngressOutcome> {
        let repo = match &event {
            SourceEvent::IssueLabeled { repo, .. } => repo,
            SourceEvent::CheckRunCompleted { repo, .. } => repo,
            SourceEvent::PullRequestMerged { repo, .. } => repo,
        };
        if !self.settings.repo_allowed(repo) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(repo = %repo, "event for unlisted repo dropped");
            return Ok(IngressOutcome::Dropped);
        }

        match event {
            SourceEvent::IssueLabeled {
                repo,
                issue_number,
                label,
                title,
                body,
            } => {
                if label == self.settings.auto_dev_label {
                    self.create_task(&repo, issue_number, &title, &body, None)
                        .await
                        .map(IngressOutcome::TaskCreated)
                } else if label == self.settings.batch_label {
                    self.create_batched_task(&repo, issue_number, &title, &body)
                        .await
                } else {
                    Ok(IngressOutcome::Ignored)
                }
            }
            SourceEvent::CheckRunCompleted {
                repo,
                branch,
                passed,
            } => self.resume_from_checks(&repo, &branch, passed).await,
            SourceEvent::PullRequestMerged { repo, pr_number } => {
                self.resume_from_merge(&repo, pr_number).await
            }
        }
    }

    /// Create a task for an issue, or return the existing one. Also used
    /// by the task API surface.
    pub async fn create_task(
        &self,
        repo: &str,
        issue_number: i32,
        title: &str,
        body: &str,
        job_id: Option<Uuid>,
    ) -> Result<Task> {
        if let Some(existing) = task_db::get_task_by_issue(&self.pool, repo, issue_number).await? {
            tracing::debug!(
                task_id = %existing.id,
                repo = %repo,
                issue = issue_number,
                "task already exists for issue"
            );
            return Ok(existing);
        }

        let task = task_db::insert_task(
            &self.pool,
            &NewTask {
                repo,
                issue_number,
                title,
                body,
                max_attempts: self.settings.max_attempts,
                job_id,
            },
        )
        .await?;

        store::append_event(&self.pool, &NewTaskEvent::bare(task.id, EventType::Created)).await;
        tracing::info!(task_id = %task.id, repo = %repo, issue = issue_number, "task created");
        Ok(task)
    }

    /// Create a task under the batch label and attach it to the repo's
    /// open job (creating one when none exists).
    async fn create_batched_task(
        &self,
        repo: &str,
        issue_number: i32,
        title: &str,
        body: &str,
    ) -> Result<IngressOutcome> {
        let open_job = job_db::find_open_job_for_repo(&self.pool, repo).await?;

        match open_job {
            Some(job) => {
                let task = self
                    .create_task(repo, issue_number, title, body, Some(job.id))
                    .await?;
                job_db::append_task_to_job(&self.pool, job.id, task.id).await?;
                store::refresh_job_summary(&self.pool, job.id).await?;
                let job = job_db::get_job(&self.pool, job.id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("job {} vanished during update", job.id))?;
                Ok(IngressOutcome::TaskAttachedToJob { task, job })
            }
            None => {
                let job = job_db::insert_job(&self.pool, repo, &[]).await?;
                let task = self
                    .create_task(repo, issue_number, title, body, Some(job.id))
                    .await?;
                job_db::append_task_to_job(&self.pool, job.id, task.id).await?;
                store::refresh_job_summary(&self.pool, job.id).await?;
                let job = job_db::get_job(&self.pool, job.id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("job {} vanished during creation", job.id))?;
                tracing::info!(job_id = %job.id, repo = %repo, "job created from batch label");
                Ok(IngressOutcome::TaskAttachedToJob { task, job })
            }
        }
    }

    /// A check run concluded: move the owning `testing` task forward.
    async fn resume_from_checks(
        &self,
        repo: &str,
        branch: &str,
        passed: bool,
    ) -> Result<IngressOutcome> {
        let Some(task) = task_db::find_task_by_branch(&self.pool, repo, branch).await? else {
            return Ok(IngressOutcome::Ignored);
        };
        if task.status != TaskStatus::Testing {
            return Ok(IngressOutcome::Ignored);
        }

        let status = if passed {
            dispatch::pass_tests(&self.pool, task.id).await?;
            TaskStatus::TestsPassed
        } else {
            dispatch::fail_tests(&self.pool, task.id).await?;
            task_db::set_last_error(&self.pool, task.id, "check suite failed on branch").await?;
            TaskStatus::TestsFailed
        };

        let mut event = NewTaskEvent::bare(task.id, EventType::Tested);
        event.output_summary = Some(if passed {
            "checks passed".to_string()
        } else {
            "checks failed".to_string()
        });
        store::append_event(&self.pool, &event).await;

        tracing::info!(task_id = %task.id, branch = %branch, passed, "task resumed by check run");
        Ok(IngressOutcome::TaskResumed {
            task_id: task.id,
            status,
        })
    }

    /// A PR merged: complete the owning task.
    async fn resume_from_merge(&self, repo: &str, pr_number: i32) -> Result<IngressOutcome> {
        let Some(task) = task_db::find_task_by_pr(&self.pool, repo, pr_number).await? else {
            return Ok(IngressOutcome::Ignored);
        };

        match task.status {
            TaskStatus::PrCreated => {
                dispatch::await_human(&self.pool, task.id).await?;
                dispatch::complete_task(&self.pool, task.id).await?;
            }
            TaskStatus::WaitingHuman => {
                dispatch::complete_task(&self.pool, task.id).await?;
            }
            _ => return Ok(IngressOutcome::Ignored),
        }

        if let Some(job_id) = task.job_id {
            store::refresh_job_summary(&self.pool, job_id).await?;
        }

        tracing::info!(task_id = %task.id, pr = pr_number, "task completed by merge");
        Ok(IngressOutcome::TaskResumed {
            task_id: task.id,
            status: TaskStatus::Completed,
        })
    }
}
