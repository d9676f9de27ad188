//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Job, JobStatus, JobSummary};

/// Insert a new job row with its member task IDs and an initial summary
/// where every task is pending.
pub async fn insert_job(pool: &PgPool, repo: &str, task_ids: &[Uuid]) -> Result<Job> {
    let summary = JobSummary {
        total: task_ids.len() as i64,
        pending: task_ids.len() as i64,
        ..Default::default()
    };

    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (repo, task_ids, summary) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(repo)
    .bind(task_ids)
    .bind(Json(summary))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert job for {repo}"))?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List all jobs, newest first.
pub async fn list_jobs(pool: &PgPool) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list jobs")?;

    Ok(jobs)
}

/// Find the most recent job for a repo that has not started running yet.
///
/// Used by ingress to attach sibling batch-labeled issues to one job.
pub async fn find_open_job_for_repo(pool: &PgPool, repo: &str) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs \
         WHERE repo = $1 AND status = 'pending' \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(repo)
    .fetch_optional(pool)
    .await
    .context("failed to find open job for repo")?;

    Ok(job)
}

/// Append a task to a job's member list.
pub async fn append_task_to_job(pool: &PgPool, job_id: Uuid, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET task_ids = array_append(task_ids, $1), updated_at = now() \
         WHERE id = $2 AND NOT (task_ids @> ARRAY[$1])",
    )
    .bind(task_id)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to append task to job")?;

    Ok(result.rows_affected())
}

/// Atomically transition a job from one status to another.
///
/// Uses optimistic locking on the current status. Returns the number of
/// rows affected (0 means the status did not match).
pub async fn transition_job_status(
    pool: &PgPool,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = $1, updated_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(job_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition job status")?;

    Ok(result.rows_affected())
}

/// Write a job summary guarded by the `updated_at` the caller read.
///
/// Returns 0 when another writer got there first; the caller re-reads the
/// job and retries the read-modify-write.
pub async fn write_job_summary(
    pool: &PgPool,
    job_id: Uuid,
    summary: &JobSummary,
    seen_updated_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET summary = $1, updated_at = now() \
         WHERE id = $2 AND updated_at = $3",
    )
    .bind(Json(summary.clone()))
    .bind(job_id)
    .bind(seen_updated_at)
    .execute(pool)
    .await
    .context("failed to write job summary")?;

    Ok(result.rows_affected())
}
