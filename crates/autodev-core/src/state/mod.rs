//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, and attempt limits.

pub mod dispatch;

use std::fmt;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::TaskStatus;
use autodev_db::queries::tasks as db;

use crate::error::OrchestratorError;

/// What the driver should do next for a task in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Plan,
    Code,
    Review,
    Test,
    Fix,
    OpenPr,
    Wait,
    Done,
    Fail,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Review => "review",
            Self::Test => "test",
            Self::Fix => "fix",
            Self::OpenPr => "open_pr",
            Self::Wait => "wait",
            Self::Done => "done",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// new             -> planning
/// planning        -> planning_done
/// planning_done   -> coding
/// planning_done   -> waiting_human   (complexity requires breakdown)
/// coding          -> coding_done
/// coding_done     -> reviewing
/// reviewing       -> review_approved
/// reviewing       -> review_rejected
/// review_rejected -> fixing          (attempts remain; counts an attempt)
/// review_approved -> waiting_batch   (coalescer claims the task)
/// review_approved -> testing         (no batch)
/// waiting_batch   -> testing         (batch processed)
/// waiting_batch   -> review_approved (batch cancelled, retry solo)
/// testing         -> tests_passed
/// testing         -> tests_failed
/// tests_failed    -> fixing          (attempts remain; counts an attempt)
/// fixing          -> coding_done     (re-review)
/// coding|reviewing|fixing -> fixing  (handler output rejected; counts an attempt)
/// tests_passed    -> pr_created
/// pr_created      -> waiting_human
/// waiting_human   -> completed
/// <any non-terminal> -> failed
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;

        // Every non-terminal state may fail: preconditions, cancellation,
        // budget caps, and exhausted attempts can strike at any point.
        if to == Failed && !from.is_terminal() {
            return true;
        }

        matches!(
            (from, to),
            (New, Planning)
                | (Planning, PlanningDone)
                | (PlanningDone, Coding)
                | (PlanningDone, WaitingHuman)
                | (Coding, CodingDone)
                | (CodingDone, Reviewing)
                | (Reviewing, ReviewApproved)
                | (Reviewing, ReviewRejected)
                | (ReviewRejected, Fixing)
                | (ReviewApproved, WaitingBatch)
                | (ReviewApproved, Testing)
                | (WaitingBatch, Testing)
                | (WaitingBatch, ReviewApproved)
                | (Testing, TestsPassed)
                | (Testing, TestsFailed)
                | (TestsFailed, Fixing)
                | (Fixing, CodingDone)
                | (Coding, Fixing)
                | (Reviewing, Fixing)
                | (Fixing, Fixing)
                | (TestsPassed, PrCreated)
                | (PrCreated, WaitingHuman)
                | (WaitingHuman, Completed)
        )
    }

    /// The driver's next move for a task in the given status.
    ///
    /// Total over all states. Mid-stage states map back to their own
    /// action so a crashed worker re-runs the interrupted stage from the
    /// durable row.
    pub fn next_action(status: TaskStatus) -> Action {
        use TaskStatus::*;
        match status {
            New | Planning => Action::Plan,
            PlanningDone | Coding => Action::Code,
            CodingDone | Reviewing => Action::Review,
            ReviewApproved | Testing => Action::Test,
            ReviewRejected | TestsFailed | Fixing => Action::Fix,
            TestsPassed => Action::OpenPr,
            PrCreated | WaitingHuman | WaitingBatch => Action::Wait,
            Completed => Action::Done,
            Failed => Action::Fail,
        }
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// A same-status transition is a no-op (idempotent replay support);
    /// no row is touched and no event should be emitted by the caller.
    ///
    /// Returns an error if:
    /// - The transition is not a valid edge
    ///   ([`OrchestratorError::InvalidStateTransition`]).
    /// - The current status in the database does not match `from`
    ///   ([`OrchestratorError::LockConflict`]).
    /// - The task does not exist.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }

        if !Self::is_valid_transition(from, to) {
            return Err(OrchestratorError::InvalidStateTransition { from, to }.into());
        }

        let rows = db::transition_task_status(pool, task_id, from, to)
            .await
            .with_context(|| {
                format!("failed to transition task {task_id} from {from} to {to}")
            })?;

        if rows == 0 {
            // Either the task does not exist or the status did not match.
            let task = db::get_task(pool, task_id).await?;
            return match task {
                None => Err(anyhow::anyhow!("task {task_id} not found")),
                Some(t) => Err(OrchestratorError::LockConflict {
                    expected: from,
                    actual: t.status,
                }
                .into()),
            };
        }

        tracing::debug!(task_id = %task_id, from = %from, to = %to, "task transitioned");
        Ok(())
    }

    /// Execute the attempt-counting transition into `fixing`.
    ///
    /// Fetches the task to check the attempt counter against
    /// `max_attempts`, then atomically increments the attempt and moves
    /// the status. Fails with `InvalidStateTransition` when the source
    /// state has no `-> fixing` edge, and with a plain error when the
    /// attempt budget is already spent (the caller should fail the task
    /// instead).
    pub async fn retry_transition(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> Result<()> {
        if !Self::is_valid_transition(from, TaskStatus::Fixing) {
            return Err(OrchestratorError::InvalidStateTransition {
                from,
                to: TaskStatus::Fixing,
            }
            .into());
        }

        let task = db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        if task.attempt_count >= task.max_attempts {
            anyhow::bail!(
                "cannot retry task {}: attempt {} >= max_attempts {}",
                task_id,
                task.attempt_count,
                task.max_attempts
            );
        }

        let rows = db::transition_task_retry(pool, task_id, from, task.attempt_count).await?;

        if rows == 0 {
            let actual = db::get_task(pool, task_id)
                .await?
                .map(|t| t.status)
                .unwrap_or(from);
            return Err(OrchestratorError::LockConflict {
                expected: from,
                actual,
            }
            .into());
        }

        Ok(())
    }
}
