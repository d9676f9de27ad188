//! Stage handlers: the closed set of four pipeline agents (planner, coder,
//! reviewer, fixer) behind one uniform `run` capability.
//!
//! Handlers are stateless with respect to tasks: the driver assembles the
//! input from the task row, the handler calls the model through
//! [`ModelClient`], parses and validates the output, and hands back a typed
//! result. All vendor-specific behavior stays behind the client trait.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use autodev_db::models::{Complexity, Effort};

use crate::diff;
use crate::model::{CompletionRequest, ModelClient, ModelClientError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// What a stage handler can fail with.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The output did not match the stage schema. Non-recoverable for
    /// this attempt.
    #[error("handler output failed validation: {0}")]
    ValidationFailed(String),

    /// The vendor endpoint was unreachable. Transient; the driver
    /// escalates to the next tier.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The output parsed but is unusable (malformed diff, empty plan).
    #[error("handler produced invalid output: {0}")]
    InvalidOutput(String),

    /// The per-call timeout elapsed.
    #[error("handler call timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    /// Transient errors trigger the escalation ladder instead of counting
    /// an attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_) | Self::TimedOut(_))
    }
}

// ---------------------------------------------------------------------------
// Stage inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PlannerInput {
    pub title: String,
    pub body: String,
    pub repo_context: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoderInput {
    pub plan: Vec<String>,
    pub definition_of_done: Vec<String>,
    pub target_files: Vec<String>,
    pub repo_context: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewerInput {
    pub issue_title: String,
    pub issue_body: String,
    pub plan: Vec<String>,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixerInput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub current_diff: String,
    pub error_logs: String,
    pub file_contents: String,
}

/// Input for one stage invocation, tagged by stage.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageInput {
    Plan(PlannerInput),
    Code(CoderInput),
    Review(ReviewerInput),
    Fix(FixerInput),
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerOutput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub target_files: Vec<String>,
    pub estimated_complexity: Complexity,
    pub estimated_effort: Effort,
    #[serde(default)]
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoderOutput {
    pub diff: String,
    pub commit_message: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Reviewer verdict on a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    RequestChanges,
    NeedsDiscussion,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewComment {
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub severity: String,
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewerOutput {
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default)]
    pub comments: Vec<ReviewComment>,
    #[serde(default)]
    pub suggested_changes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FixerOutput {
    pub diff: String,
    pub commit_message: String,
    pub fix_description: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

/// Output of one stage invocation, tagged by stage.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Planned(PlannerOutput),
    Coded(CoderOutput),
    Reviewed(ReviewerOutput),
    Fixed(FixerOutput),
}

/// A completed stage run with its metrics.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub output: StageOutput,
    pub tokens_used: Option<i64>,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// The handler union
// ---------------------------------------------------------------------------

/// The closed set of stage handlers. The driver selects by stage; there is
/// no open registry because the pipeline shape is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageHandler {
    Planner,
    Coder,
    Reviewer,
    Fixer,
}

impl StageHandler {
    pub fn name(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Fixer => "fixer",
        }
    }

    fn system(self) -> &'static str {
        match self {
            Self::Planner => {
                "You are the planning agent. Read the issue and respond with a JSON object: \
                 {definition_of_done: [string], plan: [string], target_files: [string], \
                 estimated_complexity: XS|S|M|L|XL, estimated_effort: low|medium|high, risks: [string]}."
            }
            Self::Coder => {
                "You are the coding agent. Implement the plan and respond with a JSON object: \
                 {diff: string (unified diff against the base branch), commit_message: string, \
                 files_modified: [string], notes: string?}."
            }
            Self::Reviewer => {
                "You are the review agent. Review the diff against the issue and plan and respond \
                 with a JSON object: {verdict: APPROVE|REQUEST_CHANGES|NEEDS_DISCUSSION, \
                 summary: string, comments: [{file, line?, severity, comment}], suggested_changes: string?}."
            }
            Self::Fixer => {
                "You are the fix agent. Produce a complete replacement diff that preserves the \
                 original intent and fixes the reported errors. Respond with a JSON object: \
                 {diff: string, commit_message: string, fix_description: string, files_modified: [string]}."
            }
        }
    }

    /// Whether this handler accepts the given input kind.
    fn accepts(self, input: &StageInput) -> bool {
        matches!(
            (self, input),
            (Self::Planner, StageInput::Plan(_))
                | (Self::Coder, StageInput::Code(_))
                | (Self::Reviewer, StageInput::Review(_))
                | (Self::Fixer, StageInput::Fix(_))
        )
    }

    /// Run the handler once against the given model.
    ///
    /// The call is bounded by `timeout`; vendor errors and the timeout map
    /// to the transient [`HandlerError`] variants, schema failures to
    /// `ValidationFailed`, and semantic failures (malformed diff, empty
    /// plan) to `InvalidOutput`.
    pub async fn run(
        self,
        client: &dyn ModelClient,
        input: &StageInput,
        model_id: &str,
        timeout: Duration,
    ) -> Result<StageRun, HandlerError> {
        if !self.accepts(input) {
            return Err(HandlerError::ValidationFailed(format!(
                "{} handler cannot run {} input",
                self.name(),
                stage_input_name(input)
            )));
        }

        let prompt = serde_json::to_string(input)
            .map_err(|e| HandlerError::ValidationFailed(format!("input serialization: {e}")))?;

        let request = CompletionRequest {
            model_id: model_id.to_string(),
            system: self.system().to_string(),
            prompt,
        };

        let started = Instant::now();
        let response = match tokio::time::timeout(timeout, client.complete(&request)).await {
            Err(_elapsed) => return Err(HandlerError::TimedOut(timeout)),
            Ok(Err(ModelClientError::Unavailable(msg))) => {
                return Err(HandlerError::ModelUnavailable(msg));
            }
            Ok(Err(ModelClientError::Rejected(msg))) => {
                return Err(HandlerError::ValidationFailed(format!(
                    "model rejected request: {msg}"
                )));
            }
            Ok(Ok(response)) => response,
        };
        let duration = started.elapsed();

        let text = strip_code_fence(&response.text);
        let output = match self {
            Self::Planner => StageOutput::Planned(parse_planner_output(text)?),
            Self::Coder => StageOutput::Coded(parse_coder_output(text)?),
            Self::Reviewer => StageOutput::Reviewed(parse_json(text)?),
            Self::Fixer => StageOutput::Fixed(parse_fixer_output(text)?),
        };

        Ok(StageRun {
            output,
            tokens_used: response.tokens_used,
            duration,
        })
    }
}

fn stage_input_name(input: &StageInput) -> &'static str {
    match input {
        StageInput::Plan(_) => "plan",
        StageInput::Code(_) => "code",
        StageInput::Review(_) => "review",
        StageInput::Fix(_) => "fix",
    }
}

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_start().strip_suffix("```").unwrap_or(inner).trim()
}

fn parse_json<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, HandlerError> {
    serde_json::from_str(text).map_err(|e| HandlerError::ValidationFailed(e.to_string()))
}

fn parse_planner_output(text: &str) -> Result<PlannerOutput, HandlerError> {
    let mut output: PlannerOutput = parse_json(text)?;
    if output.plan.is_empty() {
        return Err(HandlerError::InvalidOutput("planner returned an empty plan".into()));
    }
    if output.target_files.is_empty() {
        return Err(HandlerError::InvalidOutput(
            "planner returned no target files".into(),
        ));
    }
    for path in &mut output.target_files {
        *path = normalize_path(path);
    }
    Ok(output)
}

fn parse_coder_output(text: &str) -> Result<CoderOutput, HandlerError> {
    let mut output: CoderOutput = parse_json(text)?;
    let files = validate_diff(&output.diff)?;
    if output.files_modified.is_empty() {
        output.files_modified = files;
    }
    Ok(output)
}

fn parse_fixer_output(text: &str) -> Result<FixerOutput, HandlerError> {
    let mut output: FixerOutput = parse_json(text)?;
    let files = validate_diff(&output.diff)?;
    if output.files_modified.is_empty() {
        output.files_modified = files;
    }
    Ok(output)
}

/// Parse the diff to prove it is well-formed unified-diff text; returns the
/// touched paths.
fn validate_diff(text: &str) -> Result<Vec<String>, HandlerError> {
    let files = diff::parse_unified_diff(text)
        .map_err(|e| HandlerError::InvalidOutput(e.to_string()))?;
    Ok(diff::touched_paths(&files))
}

/// Normalize a target path for fingerprint comparison: strip a leading
/// `./` and collapse backslashes.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.strip_prefix("./").unwrap_or(&path).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
