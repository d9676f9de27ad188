use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task in the issue-to-PR pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Planning,
    PlanningDone,
    Coding,
    CodingDone,
    Reviewing,
    ReviewApproved,
    ReviewRejected,
    Testing,
    TestsPassed,
    TestsFailed,
    Fixing,
    PrCreated,
    WaitingHuman,
    WaitingBatch,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether this status accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the driver yields at this status and waits for an external
    /// event (batch processing, check completion, or a human merge).
    pub fn is_suspension(self) -> bool {
        matches!(self, Self::WaitingHuman | Self::WaitingBatch | Self::PrCreated)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Planning => "planning",
            Self::PlanningDone => "planning_done",
            Self::Coding => "coding",
            Self::CodingDone => "coding_done",
            Self::Reviewing => "reviewing",
            Self::ReviewApproved => "review_approved",
            Self::ReviewRejected => "review_rejected",
            Self::Testing => "testing",
            Self::TestsPassed => "tests_passed",
            Self::TestsFailed => "tests_failed",
            Self::Fixing => "fixing",
            Self::PrCreated => "pr_created",
            Self::WaitingHuman => "waiting_human",
            Self::WaitingBatch => "waiting_batch",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "planning" => Ok(Self::Planning),
            "planning_done" => Ok(Self::PlanningDone),
            "coding" => Ok(Self::Coding),
            "coding_done" => Ok(Self::CodingDone),
            "reviewing" => Ok(Self::Reviewing),
            "review_approved" => Ok(Self::ReviewApproved),
            "review_rejected" => Ok(Self::ReviewRejected),
            "testing" => Ok(Self::Testing),
            "tests_passed" => Ok(Self::TestsPassed),
            "tests_failed" => Ok(Self::TestsFailed),
            "fixing" => Ok(Self::Fixing),
            "pr_created" => Ok(Self::PrCreated),
            "waiting_human" => Ok(Self::WaitingHuman),
            "waiting_batch" => Ok(Self::WaitingBatch),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a job (a group of tasks scheduled together).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Partial | Self::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a batch (an ephemeral grouping of tasks with overlapping
/// target files, merged into one combined change set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for BatchStatus {
    type Err = BatchStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BatchStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BatchStatus`] string.
#[derive(Debug, Clone)]
pub struct BatchStatusParseError(pub String);

impl fmt::Display for BatchStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid batch status: {:?}", self.0)
    }
}

impl std::error::Error for BatchStatusParseError {}

// ---------------------------------------------------------------------------

/// Estimated complexity of a task, produced by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Xs,
    S,
    M,
    L,
    Xl,
}

impl Complexity {
    /// Whether the task is too large for a single coding pass and must be
    /// broken down by a human before an agent attempts it.
    pub fn requires_breakdown(self) -> bool {
        matches!(self, Self::L | Self::Xl)
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Xs => "xs",
            Self::S => "s",
            Self::M => "m",
            Self::L => "l",
            Self::Xl => "xl",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = ComplexityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xs" => Ok(Self::Xs),
            "s" => Ok(Self::S),
            "m" => Ok(Self::M),
            "l" => Ok(Self::L),
            "xl" => Ok(Self::Xl),
            other => Err(ComplexityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Complexity`] string.
#[derive(Debug, Clone)]
pub struct ComplexityParseError(pub String);

impl fmt::Display for ComplexityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid complexity: {:?}", self.0)
    }
}

impl std::error::Error for ComplexityParseError {}

// ---------------------------------------------------------------------------

/// Estimated effort of a task, produced by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Effort {
    type Err = EffortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(EffortParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Effort`] string.
#[derive(Debug, Clone)]
pub struct EffortParseError(pub String);

impl fmt::Display for EffortParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid effort: {:?}", self.0)
    }
}

impl std::error::Error for EffortParseError {}

// ---------------------------------------------------------------------------

/// Type of an audit event appended to a task's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Planned,
    Coded,
    Reviewed,
    Tested,
    Fixed,
    PrOpened,
    Consensus,
    Failed,
    Completed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Planned => "planned",
            Self::Coded => "coded",
            Self::Reviewed => "reviewed",
            Self::Tested => "tested",
            Self::Fixed => "fixed",
            Self::PrOpened => "pr_opened",
            Self::Consensus => "consensus",
            Self::Failed => "failed",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "planned" => Ok(Self::Planned),
            "coded" => Ok(Self::Coded),
            "reviewed" => Ok(Self::Reviewed),
            "tested" => Ok(Self::Tested),
            "fixed" => Ok(Self::Fixed),
            "pr_opened" => Ok(Self::PrOpened),
            "consensus" => Ok(Self::Consensus),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(EventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventType`] string.
#[derive(Debug, Clone)]
pub struct EventTypeParseError(pub String);

impl fmt::Display for EventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event type: {:?}", self.0)
    }
}

impl std::error::Error for EventTypeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one repository issue being processed end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub repo: String,
    pub issue_number: i32,
    pub title: String,
    pub body: String,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub definition_of_done: Option<Vec<String>>,
    pub plan: Option<Vec<String>>,
    pub target_files: Option<Vec<String>>,
    pub estimated_complexity: Option<Complexity>,
    pub estimated_effort: Option<Effort>,
    pub branch_name: Option<String>,
    pub current_diff: Option<String>,
    pub commit_message: Option<String>,
    pub pr_number: Option<i32>,
    pub pr_url: Option<String>,
    pub last_error: Option<String>,
    pub job_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An append-only audit entry for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: Uuid,
    pub event_type: EventType,
    pub agent: Option<String>,
    pub output_summary: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i32>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Aggregated progress counters for a job.
///
/// `total = completed + failed + in_progress + pending` holds at all times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub in_progress: i64,
    pub pending: i64,
    #[serde(default)]
    pub prs_created: Vec<String>,
}

/// A job -- a set of tasks scheduled together.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub repo: String,
    pub status: JobStatus,
    pub task_ids: Vec<Uuid>,
    pub summary: Json<JobSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A batch -- an ephemeral grouping of tasks whose diffs are merged before
/// test/PR. `target_files` is the union of the member tasks' target files.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub id: Uuid,
    pub repo: String,
    pub base_branch: String,
    pub target_files: Vec<String>,
    pub status: BatchStatus,
    pub task_ids: Vec<Uuid>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A model-configuration row: one pipeline position mapped to a concrete
/// model identifier.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModelConfig {
    pub position: String,
    pub model_id: String,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::New,
            TaskStatus::Planning,
            TaskStatus::PlanningDone,
            TaskStatus::Coding,
            TaskStatus::CodingDone,
            TaskStatus::Reviewing,
            TaskStatus::ReviewApproved,
            TaskStatus::ReviewRejected,
            TaskStatus::Testing,
            TaskStatus::TestsPassed,
            TaskStatus::TestsFailed,
            TaskStatus::Fixing,
            TaskStatus::PrCreated,
            TaskStatus::WaitingHuman,
            TaskStatus::WaitingBatch,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_status_terminal_and_suspension() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::New.is_terminal());

        assert!(TaskStatus::WaitingHuman.is_suspension());
        assert!(TaskStatus::WaitingBatch.is_suspension());
        assert!(TaskStatus::PrCreated.is_suspension());
        assert!(!TaskStatus::Coding.is_suspension());
    }

    #[test]
    fn job_status_display_roundtrip() {
        let variants = [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Partial,
            JobStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: JobStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn job_status_invalid() {
        let result = "nope".parse::<JobStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn batch_status_display_roundtrip() {
        let variants = [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: BatchStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn complexity_display_roundtrip() {
        let variants = [
            Complexity::Xs,
            Complexity::S,
            Complexity::M,
            Complexity::L,
            Complexity::Xl,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Complexity = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn complexity_parse_is_case_insensitive() {
        assert_eq!("XS".parse::<Complexity>().unwrap(), Complexity::Xs);
        assert_eq!("XL".parse::<Complexity>().unwrap(), Complexity::Xl);
    }

    #[test]
    fn complexity_breakdown_threshold() {
        assert!(!Complexity::Xs.requires_breakdown());
        assert!(!Complexity::M.requires_breakdown());
        assert!(Complexity::L.requires_breakdown());
        assert!(Complexity::Xl.requires_breakdown());
    }

    #[test]
    fn effort_display_roundtrip() {
        let variants = [Effort::Low, Effort::Medium, Effort::High];
        for v in &variants {
            let s = v.to_string();
            let parsed: Effort = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_type_display_roundtrip() {
        let variants = [
            EventType::Created,
            EventType::Planned,
            EventType::Coded,
            EventType::Reviewed,
            EventType::Tested,
            EventType::Fixed,
            EventType::PrOpened,
            EventType::Consensus,
            EventType::Failed,
            EventType::Completed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EventType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_type_invalid() {
        let result = "merged".parse::<EventType>();
        assert!(result.is_err());
    }

    #[test]
    fn job_summary_accounting_identity() {
        let summary = JobSummary {
            total: 5,
            completed: 2,
            failed: 1,
            in_progress: 1,
            pending: 1,
            prs_created: vec!["https://example.com/pr/1".to_string()],
        };
        assert_eq!(
            summary.total,
            summary.completed + summary.failed + summary.in_progress + summary.pending
        );
    }
}
