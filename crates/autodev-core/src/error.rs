//! Error taxonomy for the orchestrator core.
//!
//! Three layers:
//! - [`HandlerError`] -- what a stage handler can report (lives in
//!   [`crate::stage`], re-exported here).
//! - [`OrchestratorError`] -- what a driver step can fail with.
//! - [`TaskFailure`] -- the structured record written to a task when it
//!   transitions to `failed`.

use std::fmt;

use serde::{Deserialize, Serialize};

use autodev_db::models::TaskStatus;

pub use crate::stage::HandlerError;

/// Machine-readable code attached to a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    InvalidState,
    Precondition,
    ValidationFailed,
    InvalidOutput,
    ModelUnavailable,
    TimedOut,
    Store,
    Host,
    Cancelled,
    BudgetExceeded,
    AttemptsExhausted,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidState => "INVALID_STATE",
            Self::Precondition => "PRECONDITION",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidOutput => "INVALID_OUTPUT",
            Self::ModelUnavailable => "MODEL_UNAVAILABLE",
            Self::TimedOut => "TIMED_OUT",
            Self::Store => "STORE",
            Self::Host => "HOST",
            Self::Cancelled => "CANCELLED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::AttemptsExhausted => "ATTEMPTS_EXHAUSTED",
        };
        f.write_str(s)
    }
}

/// Structured failure record for a task.
///
/// There is exactly one way to fail a task (`dispatch::fail_task`), and it
/// takes this record: code, human message, optional underlying cause, and
/// whether an operator retry could plausibly succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: FailureCode,
    pub message: String,
    pub cause: Option<String>,
    pub recoverable: bool,
}

impl TaskFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            recoverable: false,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }

    /// The short human message stored in `tasks.last_error`.
    pub fn short_message(&self) -> String {
        match &self.cause {
            Some(cause) => format!("{}: {} ({})", self.code, self.message, cause),
            None => format!("{}: {}", self.code, self.message),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_message())
    }
}

/// Errors produced by a driver step.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A write would violate the state-machine predicate. Fatal, never
    /// retried.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// Another writer moved the task between our read and our guarded
    /// write. The step is abandoned; the next driver tick re-reads.
    #[error("optimistic lock failed: task has status {actual}, expected {expected}")]
    LockConflict {
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// A required field for the step was missing.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// A stage handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The backing store failed after the bounded retry budget.
    #[error("permanent store failure: {0:#}")]
    StorePermanent(anyhow::Error),

    /// The per-job cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// MAX_STEPS or the wall-clock budget was exceeded.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
}
