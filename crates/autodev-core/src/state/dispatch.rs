//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::{EventType, TaskStatus};
use autodev_db::queries::task_events::NewTaskEvent;
use autodev_db::queries::tasks as db;

use super::TaskStateMachine;
use crate::error::TaskFailure;
use crate::store;

/// Start planning: transition `new -> planning`.
pub async fn begin_planning(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::New, TaskStatus::Planning).await
}

/// Accept the planner output: transition `planning -> planning_done`.
pub async fn complete_planning(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Planning, TaskStatus::PlanningDone)
        .await
}

/// Start coding: transition `planning_done -> coding`.
pub async fn begin_coding(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::PlanningDone, TaskStatus::Coding).await
}

/// Accept the coder output: transition `coding -> coding_done`.
pub async fn complete_coding(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Coding, TaskStatus::CodingDone).await
}

/// Start review: transition `coding_done -> reviewing`.
pub async fn begin_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::CodingDone, TaskStatus::Reviewing).await
}

/// Record an APPROVE verdict: transition `reviewing -> review_approved`.
pub async fn approve_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Reviewing, TaskStatus::ReviewApproved)
        .await
}

/// Record a REQUEST_CHANGES verdict: transition `reviewing -> review_rejected`.
pub async fn reject_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Reviewing, TaskStatus::ReviewRejected)
        .await
}

/// The coalescer claims the task: transition `review_approved -> waiting_batch`.
pub async fn enter_batch(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::ReviewApproved,
        TaskStatus::WaitingBatch,
    )
    .await
}

/// The batch was processed: transition `waiting_batch -> testing`.
pub async fn batch_to_testing(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::WaitingBatch, TaskStatus::Testing)
        .await
}

/// The batch was cancelled: transition `waiting_batch -> review_approved`
/// so the task retries solo.
pub async fn batch_to_solo(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::WaitingBatch,
        TaskStatus::ReviewApproved,
    )
    .await
}

/// Start testing a solo task: transition `review_approved -> testing`.
pub async fn begin_testing(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::ReviewApproved, TaskStatus::Testing)
        .await
}

/// All checks green: transition `testing -> tests_passed`.
pub async fn pass_tests(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Testing, TaskStatus::TestsPassed).await
}

/// A check failed: transition `testing -> tests_failed`.
pub async fn fail_tests(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Testing, TaskStatus::TestsFailed).await
}

/// Enter the fix stage from `from`, incrementing the attempt counter.
///
/// Fails if the attempt budget is spent; callers check first and fail the
/// task instead.
pub async fn begin_fixing(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> Result<()> {
    TaskStateMachine::retry_transition(pool, task_id, from).await
}

/// Accept the fixer output: transition `fixing -> coding_done` (re-review).
pub async fn complete_fixing(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Fixing, TaskStatus::CodingDone).await
}

/// A pull request was opened: transition `tests_passed -> pr_created`.
pub async fn record_pr_opened(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::TestsPassed, TaskStatus::PrCreated)
        .await
}

/// Hand off to the human merge queue: transition `pr_created -> waiting_human`.
pub async fn await_human(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::PrCreated, TaskStatus::WaitingHuman)
        .await
}

/// The task's complexity requires a human breakdown before coding:
/// transition `planning_done -> waiting_human`.
pub async fn suspend_for_breakdown(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::PlanningDone,
        TaskStatus::WaitingHuman,
    )
    .await
}

/// The merge was observed: transition `waiting_human -> completed` and
/// append the terminal event.
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::WaitingHuman, TaskStatus::Completed)
        .await?;
    store::append_event(pool, &NewTaskEvent::bare(task_id, EventType::Completed)).await;
    Ok(())
}

/// Fail a task with a structured failure record.
///
/// Reads the current status (the failure may strike at any point in the
/// pipeline), records `last_error`, transitions to `failed`, and appends
/// the terminal event. The event append is best-effort.
pub async fn fail_task(pool: &PgPool, task_id: Uuid, failure: &TaskFailure) -> Result<()> {
    let task = db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if task.status == TaskStatus::Failed {
        return Ok(());
    }

    db::set_last_error(pool, task_id, &failure.short_message()).await?;
    TaskStateMachine::transition(pool, task_id, task.status, TaskStatus::Failed).await?;

    let mut event = NewTaskEvent::bare(task_id, EventType::Failed);
    event.output_summary = Some(failure.short_message());
    event.metadata = serde_json::json!({
        "code": failure.code.to_string(),
        "recoverable": failure.recoverable,
    });
    store::append_event(pool, &event).await;

    tracing::warn!(
        task_id = %task_id,
        code = %failure.code,
        error = %failure.message,
        "task failed"
    );
    Ok(())
}
