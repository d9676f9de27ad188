//! Database query functions for the `batches` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Batch, BatchStatus};

/// Insert a new batch row in `pending` status.
pub async fn insert_batch(
    pool: &PgPool,
    repo: &str,
    base_branch: &str,
    target_files: &[String],
    task_ids: &[Uuid],
) -> Result<Batch> {
    let batch = sqlx::query_as::<_, Batch>(
        "INSERT INTO batches (repo, base_branch, target_files, task_ids) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(repo)
    .bind(base_branch)
    .bind(target_files)
    .bind(task_ids)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert batch for {repo}"))?;

    Ok(batch)
}

/// Fetch a single batch by ID.
pub async fn get_batch(pool: &PgPool, id: Uuid) -> Result<Option<Batch>> {
    let batch = sqlx::query_as::<_, Batch>("SELECT * FROM batches WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch batch")?;

    Ok(batch)
}

/// Find a pending batch in a repo and base branch whose target files
/// overlap the given set. Uses the Postgres array-overlap operator.
pub async fn find_pending_overlapping(
    pool: &PgPool,
    repo: &str,
    base_branch: &str,
    target_files: &[String],
) -> Result<Option<Batch>> {
    let batch = sqlx::query_as::<_, Batch>(
        "SELECT * FROM batches \
         WHERE repo = $1 \
           AND base_branch = $2 \
           AND status = 'pending' \
           AND target_files && $3 \
         ORDER BY created_at ASC \
         LIMIT 1",
    )
    .bind(repo)
    .bind(base_branch)
    .bind(target_files)
    .fetch_optional(pool)
    .await
    .context("failed to find overlapping batch")?;

    Ok(batch)
}

/// Add a task to a batch: appends the task ID and unions the target files.
///
/// The array-union is done in SQL so concurrent adds cannot lose files.
pub async fn add_task_to_batch(
    pool: &PgPool,
    batch_id: Uuid,
    task_id: Uuid,
    target_files: &[String],
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE batches \
         SET task_ids = array_append(task_ids, $1), \
             target_files = ( \
                 SELECT ARRAY(SELECT DISTINCT unnest(target_files || $2)) \
             ) \
         WHERE id = $3 AND status = 'pending'",
    )
    .bind(task_id)
    .bind(target_files)
    .bind(batch_id)
    .execute(pool)
    .await
    .context("failed to add task to batch")?;

    Ok(result.rows_affected())
}

/// Atomically transition a batch from one status to another.
pub async fn transition_batch_status(
    pool: &PgPool,
    batch_id: Uuid,
    from: BatchStatus,
    to: BatchStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE batches SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(batch_id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition batch status")?;

    Ok(result.rows_affected())
}

/// Record the combined pull request opened for a batch.
pub async fn set_batch_pr(pool: &PgPool, batch_id: Uuid, pr_url: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE batches SET pr_url = $1 WHERE id = $2")
        .bind(pr_url)
        .bind(batch_id)
        .execute(pool)
        .await
        .context("failed to set batch pull request")?;

    Ok(result.rows_affected())
}

/// List all pending batches, oldest first.
pub async fn list_pending(pool: &PgPool) -> Result<Vec<Batch>> {
    let batches = sqlx::query_as::<_, Batch>(
        "SELECT * FROM batches WHERE status = 'pending' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending batches")?;

    Ok(batches)
}

