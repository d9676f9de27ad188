//! Batch coalescer: groups review-approved tasks whose target files
//! overlap, merges their diffs, and drives the combined change set through
//! test and a single pull request.
//!
//! Membership decisions run under a per-repo critical section so two
//! concurrent review approvals cannot create duplicate batches. Merge
//! semantics are additive-or-fall-back: any per-file hunk overlap fails
//! the batch and the member tasks retry solo.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use autodev_db::models::{Batch, BatchStatus, EventType, Task, TaskStatus};
use autodev_db::queries::batches as batch_db;
use autodev_db::queries::task_events::NewTaskEvent;
use autodev_db::queries::tasks as task_db;

use crate::diff;
use crate::host::{CheckConclusion, SourceHost};
use crate::state::dispatch;
use crate::store;

/// Coalescer tuning knobs.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    pub base_branch: String,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// How long a pending batch waits for stragglers before processing.
    pub batch_timeout: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            min_batch_size: 2,
            max_batch_size: 10,
            batch_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// What the coalescer decided for a freshly review-approved task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceOutcome {
    /// The task joined (or seeded) a batch and is now `waiting_batch`.
    Claimed(Uuid),
    /// No overlap; the task proceeds straight to testing.
    Solo,
}

/// Result of processing one due batch.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// Diffs merged, checks passed, one combined PR opened.
    PrOpened { pr_url: String },
    /// Overlapping hunks; members reverted to solo testing.
    Conflict { path: String },
    /// Merged diff failed the check suite; members continue through the
    /// fix loop with the combined artifacts.
    ChecksFailed,
    /// Too few members left to justify a batch; members released solo.
    Disbanded,
}

#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    pub batch_id: Uuid,
    pub outcome: BatchOutcome,
}

/// The coalescer. One instance per process; shared by drivers.
pub struct BatchCoalescer {
    pool: PgPool,
    config: CoalescerConfig,
    /// Per-repo critical sections for membership decisions.
    repo_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BatchCoalescer {
    pub fn new(pool: PgPool, config: CoalescerConfig) -> Self {
        Self {
            pool,
            config,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn repo_lock(&self, repo: &str) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        locks
            .entry(repo.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Decide batch membership for a task that just reached
    /// `review_approved`.
    ///
    /// A task that already carries a `batch_id` has been through a failed
    /// batch; it bypasses the coalescer and proceeds solo.
    pub async fn on_review_approved(&self, task: &Task) -> Result<CoalesceOutcome> {
        if task.batch_id.is_some() {
            tracing::debug!(task_id = %task.id, "task already batched once, proceeding solo");
            return Ok(CoalesceOutcome::Solo);
        }

        let Some(target_files) = task.target_files.as_deref() else {
            return Ok(CoalesceOutcome::Solo);
        };
        if target_files.is_empty() {
            return Ok(CoalesceOutcome::Solo);
        }

        let lock = self.repo_lock(&task.repo).await;
        let _guard = lock.lock().await;

        // 1. An existing pending batch with overlapping files claims the task.
        if let Some(batch) = batch_db::find_pending_overlapping(
            &self.pool,
            &task.repo,
            &self.config.base_branch,
            target_files,
        )
        .await?
        {
            if batch.task_ids.len() < self.config.max_batch_size {
                if self.claim(task, batch.id, target_files).await? {
                    return Ok(CoalesceOutcome::Claimed(batch.id));
                }
                // The batch slipped into processing between lookup and
                // claim; proceed solo.
                return Ok(CoalesceOutcome::Solo);
            }
            tracing::debug!(
                task_id = %task.id,
                batch_id = %batch.id,
                "overlapping batch is full, proceeding solo"
            );
            return Ok(CoalesceOutcome::Solo);
        }

        // 2. Other unbatched review-approved tasks with overlapping files
        //    seed a new batch together with this one.
        let peers =
            task_db::list_unbatched_overlapping(&self.pool, &task.repo, target_files, task.id)
                .await?;
        if peers.is_empty() {
            return Ok(CoalesceOutcome::Solo);
        }

        let mut members: Vec<&Task> = Vec::with_capacity(peers.len() + 1);
        members.push(task);
        members.extend(peers.iter());
        members.truncate(self.config.max_batch_size);

        let union: Vec<String> = {
            let mut files: Vec<String> = members
                .iter()
                .flat_map(|t| t.target_files.clone().unwrap_or_default())
                .collect();
            files.sort();
            files.dedup();
            files
        };
        let member_ids: Vec<Uuid> = members.iter().map(|t| t.id).collect();

        let batch = batch_db::insert_batch(
            &self.pool,
            &task.repo,
            &self.config.base_branch,
            &union,
            &member_ids,
        )
        .await?;

        for member in &members {
            task_db::set_batch_membership(&self.pool, member.id, Some(batch.id)).await?;
            dispatch::enter_batch(&self.pool, member.id).await?;
        }

        tracing::info!(
            batch_id = %batch.id,
            repo = %task.repo,
            members = member_ids.len(),
            "created batch from overlapping tasks"
        );
        Ok(CoalesceOutcome::Claimed(batch.id))
    }

    async fn claim(&self, task: &Task, batch_id: Uuid, target_files: &[String]) -> Result<bool> {
        let rows =
            batch_db::add_task_to_batch(&self.pool, batch_id, task.id, target_files).await?;
        if rows == 0 {
            return Ok(false);
        }
        task_db::set_batch_membership(&self.pool, task.id, Some(batch_id)).await?;
        dispatch::enter_batch(&self.pool, task.id).await?;
        tracing::info!(task_id = %task.id, batch_id = %batch_id, "task joined batch");
        Ok(true)
    }

    /// Process every batch that is due: all members waiting, or the wait
    /// window expired.
    pub async fn process_due(&self, host: &dyn SourceHost) -> Result<Vec<ProcessedBatch>> {
        let now = Utc::now();
        let expiry_cutoff = now
            - chrono::Duration::from_std(self.config.batch_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));

        let mut processed = Vec::new();
        for batch in batch_db::list_pending(&self.pool).await? {
            let members = self.members(&batch).await?;
            let all_waiting = !members.is_empty()
                && members.iter().all(|t| t.status == TaskStatus::WaitingBatch);
            let expired = batch.created_at <= expiry_cutoff;

            if !all_waiting && !expired {
                continue;
            }

            let outcome = self.process_batch(&batch, host).await?;
            processed.push(ProcessedBatch {
                batch_id: batch.id,
                outcome,
            });
        }
        Ok(processed)
    }

    async fn members(&self, batch: &Batch) -> Result<Vec<Task>> {
        let mut members = Vec::with_capacity(batch.task_ids.len());
        for id in &batch.task_ids {
            if let Some(task) = task_db::get_task(&self.pool, *id).await? {
                members.push(task);
            }
        }
        Ok(members)
    }

    /// Combine one batch: merge diffs, test, and open a single PR.
    pub async fn process_batch(&self, batch: &Batch, host: &dyn SourceHost) -> Result<BatchOutcome> {
        let rows = batch_db::transition_batch_status(
            &self.pool,
            batch.id,
            BatchStatus::Pending,
            BatchStatus::Processing,
        )
        .await?;
        if rows == 0 {
            // Another worker claimed it.
            return Ok(BatchOutcome::Disbanded);
        }

        let members: Vec<Task> = self
            .members(batch)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::WaitingBatch)
            .collect();

        if members.len() < self.config.min_batch_size {
            tracing::info!(
                batch_id = %batch.id,
                members = members.len(),
                "batch below minimum size, disbanding"
            );
            self.release_members_solo(&members).await?;
            batch_db::transition_batch_status(
                &self.pool,
                batch.id,
                BatchStatus::Processing,
                BatchStatus::Failed,
            )
            .await?;
            return Ok(BatchOutcome::Disbanded);
        }

        // Parse every member diff. A member without a parseable diff fails
        // the whole batch conservatively.
        let mut parsed = Vec::with_capacity(members.len());
        for member in &members {
            let text = member
                .current_diff
                .as_deref()
                .with_context(|| format!("batch member {} has no diff", member.id))?;
            match diff::parse_unified_diff(text) {
                Ok(files) => parsed.push(files),
                Err(e) => {
                    tracing::warn!(batch_id = %batch.id, task_id = %member.id, error = %e,
                        "member diff does not parse, failing batch");
                    self.release_members_solo(&members).await?;
                    batch_db::transition_batch_status(
                        &self.pool,
                        batch.id,
                        BatchStatus::Processing,
                        BatchStatus::Failed,
                    )
                    .await?;
                    return Ok(BatchOutcome::Disbanded);
                }
            }
        }

        let merged = match diff::merge_diffs(&parsed) {
            Ok(merged) => merged,
            Err(conflict) => {
                tracing::info!(
                    batch_id = %batch.id,
                    path = %conflict.path,
                    "batch diffs conflict, members revert to solo"
                );
                self.release_members_solo(&members).await?;
                batch_db::transition_batch_status(
                    &self.pool,
                    batch.id,
                    BatchStatus::Processing,
                    BatchStatus::Failed,
                )
                .await?;
                return Ok(BatchOutcome::Conflict {
                    path: conflict.path,
                });
            }
        };

        let combined_diff = diff::render(&merged);
        let combined_commit = members
            .iter()
            .filter_map(|t| t.commit_message.clone())
            .collect::<Vec<_>>()
            .join("\n\n");
        let branch = format!("autodev/batch-{}", batch.id.simple());

        // Members move to testing carrying the combined artifacts.
        for member in &members {
            task_db::set_coding_outputs(
                &self.pool,
                member.id,
                &branch,
                &combined_diff,
                &combined_commit,
            )
            .await?;
            dispatch::batch_to_testing(&self.pool, member.id).await?;

            let mut event = NewTaskEvent::bare(member.id, EventType::Consensus);
            event.output_summary = Some(format!(
                "diffs merged with {} sibling task(s)",
                members.len() - 1
            ));
            event.metadata = serde_json::json!({
                "batch_id": batch.id,
                "branch": branch,
            });
            store::append_event(&self.pool, &event).await;
        }

        host.create_branch(&batch.repo, &batch.base_branch, &branch)
            .await?;
        host.apply_diff(&batch.repo, &branch, &combined_diff, &combined_commit)
            .await?;

        match host.run_checks(&batch.repo, &branch).await? {
            CheckConclusion::Failed => {
                for member in &members {
                    dispatch::fail_tests(&self.pool, member.id).await?;
                    task_db::set_last_error(
                        &self.pool,
                        member.id,
                        "combined batch diff failed checks",
                    )
                    .await?;
                    let mut event = NewTaskEvent::bare(member.id, EventType::Tested);
                    event.output_summary = Some("batch checks failed".to_string());
                    store::append_event(&self.pool, &event).await;
                }
                batch_db::transition_batch_status(
                    &self.pool,
                    batch.id,
                    BatchStatus::Processing,
                    BatchStatus::Failed,
                )
                .await?;
                return Ok(BatchOutcome::ChecksFailed);
            }
            CheckConclusion::Passed => {}
        }

        let issue_list = members
            .iter()
            .map(|t| format!("- {}#{}: {}", t.repo, t.issue_number, t.title))
            .collect::<Vec<_>>()
            .join("\n");
        let pr_body = format!("Combined change set for:\n{issue_list}\n");
        let title = format!("autodev: batch of {} issues", members.len());

        let pr = host
            .open_pull_request(&batch.repo, &branch, &batch.base_branch, &title, &pr_body)
            .await?;

        batch_db::set_batch_pr(&self.pool, batch.id, &pr.url).await?;
        for member in &members {
            dispatch::pass_tests(&self.pool, member.id).await?;
            let mut event = NewTaskEvent::bare(member.id, EventType::Tested);
            event.output_summary = Some("batch checks passed".to_string());
            store::append_event(&self.pool, &event).await;

            task_db::set_pr_info(&self.pool, member.id, pr.number, &pr.url).await?;
            dispatch::record_pr_opened(&self.pool, member.id).await?;
            let mut event = NewTaskEvent::bare(member.id, EventType::PrOpened);
            event.output_summary = Some(pr.url.clone());
            event.metadata = serde_json::json!({"batch_id": batch.id, "pr_number": pr.number});
            store::append_event(&self.pool, &event).await;
        }

        batch_db::transition_batch_status(
            &self.pool,
            batch.id,
            BatchStatus::Processing,
            BatchStatus::Completed,
        )
        .await?;

        tracing::info!(batch_id = %batch.id, pr_url = %pr.url, "batch PR opened");
        Ok(BatchOutcome::PrOpened { pr_url: pr.url })
    }

    /// Send members back to `review_approved` so each proceeds to its own
    /// testing run. Their `batch_id` stays set, which makes them bypass
    /// the coalescer on the next pass.
    async fn release_members_solo(&self, members: &[Task]) -> Result<()> {
        for member in members {
            if member.status == TaskStatus::WaitingBatch {
                dispatch::batch_to_solo(&self.pool, member.id).await?;
            }
        }
        Ok(())
    }
}
