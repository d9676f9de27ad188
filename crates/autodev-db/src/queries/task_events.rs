//! Database query functions for the `task_events` table.
//!
//! Events are append-only. Per-task ordering is by `created_at`, with the
//! serial `id` as the tiebreak for events inserted in the same microsecond.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{EventType, TaskEvent};

/// Parameters for appending a new task event row.
#[derive(Debug, Clone)]
pub struct NewTaskEvent {
    pub task_id: Uuid,
    pub event_type: EventType,
    pub agent: Option<String>,
    pub output_summary: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i32>,
    pub metadata: Value,
}

impl NewTaskEvent {
    /// A bare event with no agent attribution or metrics.
    pub fn bare(task_id: Uuid, event_type: EventType) -> Self {
        Self {
            task_id,
            event_type,
            agent: None,
            output_summary: None,
            tokens_used: None,
            duration_ms: None,
            metadata: Value::Object(Default::default()),
        }
    }
}

/// Append a new task event row. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_task_event(pool: &PgPool, new: &NewTaskEvent) -> Result<TaskEvent> {
    let event = sqlx::query_as::<_, TaskEvent>(
        "INSERT INTO task_events \
         (task_id, event_type, agent, output_summary, tokens_used, duration_ms, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.event_type)
    .bind(&new.agent)
    .bind(&new.output_summary)
    .bind(new.tokens_used)
    .bind(new.duration_ms)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert {} event for task {}",
            new.event_type, new.task_id
        )
    })?;

    Ok(event)
}

/// Get all events for a given task, in append order.
pub async fn list_events_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events \
         WHERE task_id = $1 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for task {task_id}"))?;

    Ok(events)
}

/// Get all events for every task in a job, in append order.
pub async fn list_events_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT e.* FROM task_events e \
         JOIN tasks t ON t.id = e.task_id \
         WHERE t.job_id = $1 \
         ORDER BY e.created_at ASC, e.id ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for job {job_id}"))?;

    Ok(events)
}

/// Count the number of events for a given task.
pub async fn count_events_for_task(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_events WHERE task_id = $1")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to count events for task {task_id}"))?;

    Ok(row.0)
}
