//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Complexity, Effort, Task, TaskStatus};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub repo: &'a str,
    pub issue_number: i32,
    pub title: &'a str,
    pub body: &'a str,
    pub max_attempts: i32,
    pub job_id: Option<Uuid>,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status, attempt_count).
pub async fn insert_task(pool: &PgPool, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (repo, issue_number, title, body, max_attempts, job_id) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.repo)
    .bind(new.issue_number)
    .bind(new.title)
    .bind(new.body)
    .bind(new.max_attempts)
    .bind(new.job_id)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert task for {}#{}",
            new.repo, new.issue_number
        )
    })?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task by its repo and issue number.
pub async fn get_task_by_issue(
    pool: &PgPool,
    repo: &str,
    issue_number: i32,
) -> Result<Option<Task>> {
    let task =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo = $1 AND issue_number = $2")
            .bind(repo)
            .bind(issue_number)
            .fetch_optional(pool)
            .await
            .context("failed to fetch task by issue")?;

    Ok(task)
}

/// List all tasks, newest first.
pub async fn list_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// List all tasks for a given job, in submission order.
pub async fn list_tasks_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<Task>> {
    let tasks =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE job_id = $1 ORDER BY created_at ASC")
            .bind(job_id)
            .fetch_all(pool)
            .await
            .context("failed to list tasks for job")?;

    Ok(tasks)
}

/// List all tasks still in `new` status, oldest first.
pub async fn list_pending(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'new' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks")?;

    Ok(tasks)
}

/// Find the task owning a branch in a repo, if any.
pub async fn find_task_by_branch(pool: &PgPool, repo: &str, branch: &str) -> Result<Option<Task>> {
    let task =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo = $1 AND branch_name = $2")
            .bind(repo)
            .bind(branch)
            .fetch_optional(pool)
            .await
            .context("failed to find task by branch")?;

    Ok(task)
}

/// Find the task owning a pull request in a repo, if any.
pub async fn find_task_by_pr(pool: &PgPool, repo: &str, pr_number: i32) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo = $1 AND pr_number = $2")
        .bind(repo)
        .bind(pr_number)
        .fetch_optional(pool)
        .await
        .context("failed to find task by pull request")?;

    Ok(task)
}

// -----------------------------------------------------------------------
// State-machine queries
// -----------------------------------------------------------------------

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches the expected `from` value. Returns the number of rows
/// affected (0 means the status did not match).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, updated_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Atomically transition a task into `fixing`, incrementing the attempt
/// counter. Uses optimistic locking on both status and the current attempt
/// value so concurrent retries cannot double-count.
pub async fn transition_task_retry(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    current_attempt: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'fixing', \
             attempt_count = attempt_count + 1, \
             updated_at = now() \
         WHERE id = $1 AND status = $2 AND attempt_count = $3",
    )
    .bind(task_id)
    .bind(from)
    .bind(current_attempt)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// Persist the planner stage outputs on a task.
pub async fn set_planning_outputs(
    pool: &PgPool,
    task_id: Uuid,
    definition_of_done: &[String],
    plan: &[String],
    target_files: &[String],
    complexity: Complexity,
    effort: Effort,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET definition_of_done = $1, \
             plan = $2, \
             target_files = $3, \
             estimated_complexity = $4, \
             estimated_effort = $5, \
             updated_at = now() \
         WHERE id = $6",
    )
    .bind(definition_of_done)
    .bind(plan)
    .bind(target_files)
    .bind(complexity)
    .bind(effort)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set planning outputs")?;

    Ok(result.rows_affected())
}

/// Persist the coder (or fixer) stage outputs on a task.
pub async fn set_coding_outputs(
    pool: &PgPool,
    task_id: Uuid,
    branch_name: &str,
    current_diff: &str,
    commit_message: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET branch_name = $1, \
             current_diff = $2, \
             commit_message = $3, \
             updated_at = now() \
         WHERE id = $4",
    )
    .bind(branch_name)
    .bind(current_diff)
    .bind(commit_message)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set coding outputs")?;

    Ok(result.rows_affected())
}

/// Persist the opened pull request on a task.
pub async fn set_pr_info(
    pool: &PgPool,
    task_id: Uuid,
    pr_number: i32,
    pr_url: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET pr_number = $1, pr_url = $2, updated_at = now() \
         WHERE id = $3",
    )
    .bind(pr_number)
    .bind(pr_url)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set pull request info")?;

    Ok(result.rows_affected())
}

/// Record the latest error message on a task.
pub async fn set_last_error(pool: &PgPool, task_id: Uuid, message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET last_error = $1, updated_at = now() WHERE id = $2",
    )
    .bind(message)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set last error")?;

    Ok(result.rows_affected())
}

/// Attach (or detach, with `None`) a task to a batch.
pub async fn set_batch_membership(
    pool: &PgPool,
    task_id: Uuid,
    batch_id: Option<Uuid>,
) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET batch_id = $1, updated_at = now() WHERE id = $2")
            .bind(batch_id)
            .bind(task_id)
            .execute(pool)
            .await
            .context("failed to set batch membership")?;

    Ok(result.rows_affected())
}

/// List review-approved tasks in a repo, outside any batch, whose target
/// files overlap the given set. Uses the Postgres array-overlap operator.
pub async fn list_unbatched_overlapping(
    pool: &PgPool,
    repo: &str,
    target_files: &[String],
    exclude_task: Uuid,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE repo = $1 \
           AND status = 'review_approved' \
           AND batch_id IS NULL \
           AND id != $2 \
           AND target_files && $3 \
         ORDER BY created_at ASC",
    )
    .bind(repo)
    .bind(exclude_task)
    .bind(target_files)
    .fetch_all(pool)
    .await
    .context("failed to list overlapping review-approved tasks")?;

    Ok(tasks)
}

/// Status counts for a job's tasks.
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Get a summary of task counts for a given job, bucketed into the four
/// job-summary counters: `new` is pending, terminal states count as
/// completed/failed, everything else is in progress.
pub async fn get_job_progress(pool: &PgPool, job_id: Uuid) -> Result<JobProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM tasks \
         WHERE job_id = $1 \
         GROUP BY status",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to get job progress")?;

    let mut progress = JobProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "new" => progress.pending += count,
            "completed" => progress.completed += count,
            "failed" => progress.failed += count,
            _ => progress.in_progress += count,
        }
        progress.total += count;
    }
    Ok(progress)
}
