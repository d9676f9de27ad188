//! Per-task driver: validates the step precondition, invokes the stage
//! handler, persists results and an audit event, and decides the next
//! step or suspends.
//!
//! Modeled as a single `step(task)` function invoked in a loop, so the
//! driver can be checkpointed and resumed from the durable task row at any
//! stage boundary. The driver never caches status across suspension
//! points; every tick re-reads the row.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use autodev_db::models::{EventType, Task, TaskStatus};
use autodev_db::queries::task_events::NewTaskEvent;
use autodev_db::queries::tasks as task_db;

use crate::coalesce::{BatchCoalescer, CoalesceOutcome};
use crate::error::{FailureCode, OrchestratorError, TaskFailure};
use crate::host::{CheckConclusion, SourceHost};
use crate::model::ModelClient;
use crate::selector::{ModelSelector, Selection, SelectionContext, Tier};
use crate::settings::OrchestratorSettings;
use crate::stage::{
    CoderInput, FixerInput, HandlerError, PlannerInput, ReviewerInput, StageHandler, StageInput,
    StageOutput, StageRun, Verdict,
};
use crate::state::{dispatch, Action, TaskStateMachine};
use crate::store;
use crate::diff;

/// Driver budgets and wiring knobs.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Maximum stage steps per invocation.
    pub max_steps: u32,
    /// Wall-clock budget per invocation.
    pub wall_clock: Duration,
    /// Per stage-handler call timeout.
    pub handler_timeout: Duration,
    /// Branch pull requests merge into.
    pub base_branch: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            wall_clock: Duration::from_secs(15 * 60),
            handler_timeout: Duration::from_secs(5 * 60),
            base_branch: "main".to_string(),
        }
    }
}

/// Result of one driver step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The task advanced; keep stepping.
    Advanced,
    /// The task entered a suspension state; stop and wait for an external
    /// event.
    Suspended,
    /// The task is terminal.
    Terminal,
}

/// The per-task driver. One instance serves many tasks; all state lives
/// in the store.
pub struct TaskDriver {
    pool: PgPool,
    client: Arc<dyn ModelClient>,
    host: Arc<dyn SourceHost>,
    selector: Arc<ModelSelector>,
    coalescer: Arc<BatchCoalescer>,
    settings: Arc<OrchestratorSettings>,
    config: DriverConfig,
}

impl TaskDriver {
    pub fn new(
        pool: PgPool,
        client: Arc<dyn ModelClient>,
        host: Arc<dyn SourceHost>,
        selector: Arc<ModelSelector>,
        coalescer: Arc<BatchCoalescer>,
        settings: Arc<OrchestratorSettings>,
        config: DriverConfig,
    ) -> Self {
        Self {
            pool,
            client,
            host,
            selector,
            coalescer,
            settings,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drive one task until it suspends, terminates, or exhausts its
    /// step/time budget. Returns the status the task was left in.
    pub async fn run_task(&self, task_id: Uuid, cancel: &CancellationToken) -> Result<TaskStatus> {
        let started = Instant::now();
        let mut steps: u32 = 0;

        loop {
            let task = store::with_backoff("get_task", || task_db::get_task(&self.pool, task_id))
                .await?
                .with_context(|| format!("task {task_id} not found"))?;

            if task.status.is_terminal() {
                return Ok(task.status);
            }
            if task.status.is_suspension() {
                return Ok(task.status);
            }

            // Cancellation is observed only at stage boundaries.
            if cancel.is_cancelled() {
                let failure = TaskFailure::new(FailureCode::Cancelled, "job cancelled")
                    .recoverable();
                dispatch::fail_task(&self.pool, task_id, &failure).await?;
                return Ok(TaskStatus::Failed);
            }

            if steps >= self.config.max_steps {
                let failure = TaskFailure::new(
                    FailureCode::BudgetExceeded,
                    format!("exceeded {} steps in one invocation", self.config.max_steps),
                );
                dispatch::fail_task(&self.pool, task_id, &failure).await?;
                return Ok(TaskStatus::Failed);
            }
            if started.elapsed() >= self.config.wall_clock {
                let failure = TaskFailure::new(
                    FailureCode::BudgetExceeded,
                    format!(
                        "exceeded {}s wall clock in one invocation",
                        self.config.wall_clock.as_secs()
                    ),
                );
                dispatch::fail_task(&self.pool, task_id, &failure).await?;
                return Ok(TaskStatus::Failed);
            }

            steps += 1;
            match self.step(&task).await {
                Ok(StepOutcome::Advanced) => continue,
                Ok(StepOutcome::Suspended) => {
                    let task = task_db::get_task(&self.pool, task_id)
                        .await?
                        .with_context(|| format!("task {task_id} not found"))?;
                    return Ok(task.status);
                }
                Ok(StepOutcome::Terminal) => {
                    let task = task_db::get_task(&self.pool, task_id)
                        .await?
                        .with_context(|| format!("task {task_id} not found"))?;
                    return Ok(task.status);
                }
                Err(err) => {
                    self.handle_step_error(&task, err).await?;
                    // Re-read on the next iteration; a failure handler may
                    // have moved the task to `fixing` or `failed`.
                    continue;
                }
            }
        }
    }

    /// Execute one stage step for the task. Pure dispatch on
    /// `next_action(status)`.
    pub async fn step(&self, task: &Task) -> Result<StepOutcome> {
        let action = TaskStateMachine::next_action(task.status);
        tracing::debug!(task_id = %task.id, status = %task.status, action = %action, "driver step");
        match action {
            Action::Plan => self.step_plan(task).await,
            Action::Code => self.step_code(task).await,
            Action::Review => self.step_review(task).await,
            Action::Test => self.step_test(task).await,
            Action::Fix => self.step_fix(task).await,
            Action::OpenPr => self.step_open_pr(task).await,
            Action::Wait => Ok(StepOutcome::Suspended),
            Action::Done | Action::Fail => Ok(StepOutcome::Terminal),
        }
    }

    // -----------------------------------------------------------------------
    // Stage steps
    // -----------------------------------------------------------------------

    async fn step_plan(&self, task: &Task) -> Result<StepOutcome> {
        if task.body.trim().is_empty() {
            return Err(OrchestratorError::PreconditionViolation(
                "plan step requires an issue body".to_string(),
            )
            .into());
        }

        dispatch::begin_planning(&self.pool, task.id).await.or_else(
            |e| ignore_if_resumed(e, task.status, TaskStatus::Planning),
        )?;

        let input = StageInput::Plan(PlannerInput {
            title: task.title.clone(),
            body: task.body.clone(),
            repo_context: task.repo.clone(),
        });

        let (run, model_id) = match self.run_stage(task, Action::Plan, &input).await {
            Ok(ok) => ok,
            Err(err) => return self.handle_handler_failure(task, TaskStatus::Planning, err).await,
        };

        let StageOutput::Planned(output) = run.output else {
            anyhow::bail!("planner returned a non-plan output");
        };

        task_db::set_planning_outputs(
            &self.pool,
            task.id,
            &output.definition_of_done,
            &output.plan,
            &output.target_files,
            output.estimated_complexity,
            output.estimated_effort,
        )
        .await?;
        dispatch::complete_planning(&self.pool, task.id).await?;

        let mut event = NewTaskEvent::bare(task.id, EventType::Planned);
        event.agent = Some(model_id);
        event.tokens_used = run.tokens_used;
        event.duration_ms = Some(run.duration.as_millis() as i32);
        event.output_summary = Some(format!(
            "complexity {}, effort {}, {} step(s), {} file(s)",
            output.estimated_complexity,
            output.estimated_effort,
            output.plan.len(),
            output.target_files.len()
        ));
        store::append_event(&self.pool, &event).await;

        Ok(StepOutcome::Advanced)
    }

    async fn step_code(&self, task: &Task) -> Result<StepOutcome> {
        let plan = require_list(&task.plan, "code step requires a plan")?;
        let target_files = require_list(&task.target_files, "code step requires target files")?;

        let selection = self
            .selector
            .select(&SelectionContext {
                action: Action::Code,
                complexity: task.estimated_complexity,
                effort: task.estimated_effort,
                attempt_count: task.attempt_count,
            })
            .await?;

        if selection.requires_breakdown {
            tracing::info!(
                task_id = %task.id,
                complexity = ?task.estimated_complexity,
                "task requires human breakdown, suspending"
            );
            dispatch::suspend_for_breakdown(&self.pool, task.id).await?;
            return Ok(StepOutcome::Suspended);
        }

        dispatch::begin_coding(&self.pool, task.id).await.or_else(
            |e| ignore_if_resumed(e, task.status, TaskStatus::Coding),
        )?;

        let input = StageInput::Code(CoderInput {
            plan: plan.to_vec(),
            definition_of_done: task.definition_of_done.clone().unwrap_or_default(),
            target_files: target_files.to_vec(),
            repo_context: task.repo.clone(),
        });

        let (run, model_id) = match self
            .run_stage_with(task, StageHandler::Coder, &input, selection)
            .await
        {
            Ok(ok) => ok,
            Err(err) => return self.handle_handler_failure(task, TaskStatus::Coding, err).await,
        };

        let StageOutput::Coded(output) = run.output else {
            anyhow::bail!("coder returned a non-code output");
        };

        if let Err(err) = self.check_diff_policy(&output.diff) {
            return self.handle_handler_failure(task, TaskStatus::Coding, err).await;
        }

        let branch = task
            .branch_name
            .clone()
            .unwrap_or_else(|| format!("autodev/issue-{}", task.issue_number));
        task_db::set_coding_outputs(
            &self.pool,
            task.id,
            &branch,
            &output.diff,
            &output.commit_message,
        )
        .await?;
        dispatch::complete_coding(&self.pool, task.id).await?;

        let mut event = NewTaskEvent::bare(task.id, EventType::Coded);
        event.agent = Some(model_id);
        event.tokens_used = run.tokens_used;
        event.duration_ms = Some(run.duration.as_millis() as i32);
        event.output_summary = Some(format!("{} file(s) modified", output.files_modified.len()));
        store::append_event(&self.pool, &event).await;

        Ok(StepOutcome::Advanced)
    }

    async fn step_review(&self, task: &Task) -> Result<StepOutcome> {
        let diff_text = require_str(&task.current_diff, "review step requires a diff")?;

        dispatch::begin_review(&self.pool, task.id).await.or_else(
            |e| ignore_if_resumed(e, task.status, TaskStatus::Reviewing),
        )?;

        let input = StageInput::Review(ReviewerInput {
            issue_title: task.title.clone(),
            issue_body: task.body.clone(),
            plan: task.plan.clone().unwrap_or_default(),
            diff: diff_text.to_string(),
        });

        let (run, model_id) = match self.run_stage(task, Action::Review, &input).await {
            Ok(ok) => ok,
            Err(err) => {
                return self.handle_handler_failure(task, TaskStatus::Reviewing, err).await;
            }
        };

        let StageOutput::Reviewed(output) = run.output else {
            anyhow::bail!("reviewer returned a non-review output");
        };

        let mut event = NewTaskEvent::bare(task.id, EventType::Reviewed);
        event.agent = Some(model_id);
        event.tokens_used = run.tokens_used;
        event.duration_ms = Some(run.duration.as_millis() as i32);
        event.output_summary = Some(format!("{:?}: {}", output.verdict, output.summary));
        event.metadata = serde_json::json!({
            "verdict": output.verdict,
            "comments": output.comments.len(),
        });

        match output.verdict {
            Verdict::Approve => {
                dispatch::approve_review(&self.pool, task.id).await?;
                store::append_event(&self.pool, &event).await;

                let task = task_db::get_task(&self.pool, task.id)
                    .await?
                    .with_context(|| format!("task {} not found", task.id))?;
                match self.coalescer.on_review_approved(&task).await? {
                    CoalesceOutcome::Claimed(batch_id) => {
                        tracing::info!(task_id = %task.id, batch_id = %batch_id, "task waiting on batch");
                        Ok(StepOutcome::Suspended)
                    }
                    CoalesceOutcome::Solo => Ok(StepOutcome::Advanced),
                }
            }
            Verdict::RequestChanges | Verdict::NeedsDiscussion => {
                dispatch::reject_review(&self.pool, task.id).await?;
                store::append_event(&self.pool, &event).await;
                task_db::set_last_error(
                    &self.pool,
                    task.id,
                    &format!("review requested changes: {}", output.summary),
                )
                .await?;
                self.retry_or_fail(task, TaskStatus::ReviewRejected, &output.summary)
                    .await
            }
        }
    }

    async fn step_test(&self, task: &Task) -> Result<StepOutcome> {
        let branch = require_str(&task.branch_name, "test step requires a branch")?.to_string();
        let diff_text = require_str(&task.current_diff, "test step requires a diff")?.to_string();
        let commit_message = task
            .commit_message
            .clone()
            .unwrap_or_else(|| format!("autodev: {}", task.title));

        dispatch::begin_testing(&self.pool, task.id).await.or_else(
            |e| ignore_if_resumed(e, task.status, TaskStatus::Testing),
        )?;

        let conclusion = async {
            self.host
                .create_branch(&task.repo, &self.config.base_branch, &branch)
                .await?;
            self.host
                .apply_diff(&task.repo, &branch, &diff_text, &commit_message)
                .await?;
            self.host.run_checks(&task.repo, &branch).await
        }
        .await;

        let conclusion = match conclusion {
            Ok(conclusion) => conclusion,
            Err(e) => {
                let failure = TaskFailure::new(FailureCode::Host, "source host operation failed")
                    .with_cause(format!("{e:#}"))
                    .recoverable();
                self.fail_with_comment(task, &failure).await?;
                return Ok(StepOutcome::Terminal);
            }
        };

        let mut event = NewTaskEvent::bare(task.id, EventType::Tested);
        match conclusion {
            CheckConclusion::Passed => {
                dispatch::pass_tests(&self.pool, task.id).await?;
                event.output_summary = Some("checks passed".to_string());
                store::append_event(&self.pool, &event).await;
                Ok(StepOutcome::Advanced)
            }
            CheckConclusion::Failed => {
                dispatch::fail_tests(&self.pool, task.id).await?;
                event.output_summary = Some("checks failed".to_string());
                store::append_event(&self.pool, &event).await;
                task_db::set_last_error(&self.pool, task.id, "check suite failed on branch")
                    .await?;
                self.retry_or_fail(task, TaskStatus::TestsFailed, "check suite failed")
                    .await
            }
        }
    }

    async fn step_fix(&self, task: &Task) -> Result<StepOutcome> {
        // A crash between the verdict write and the retry transition leaves
        // the task in `review_rejected`/`tests_failed`; re-apply the
        // attempt gate here.
        if matches!(
            task.status,
            TaskStatus::ReviewRejected | TaskStatus::TestsFailed
        ) {
            let reason = task
                .last_error
                .clone()
                .unwrap_or_else(|| "previous stage failed".to_string());
            return self.retry_or_fail(task, task.status, &reason).await;
        }

        let plan = require_list(&task.plan, "fix step requires a plan")?;
        let diff_text = require_str(&task.current_diff, "fix step requires the current diff")?;
        let error_logs = require_str(
            &task.last_error,
            "fix step requires error context from the failed stage",
        )?;

        let input = StageInput::Fix(FixerInput {
            definition_of_done: task.definition_of_done.clone().unwrap_or_default(),
            plan: plan.to_vec(),
            current_diff: diff_text.to_string(),
            error_logs: error_logs.to_string(),
            file_contents: String::new(),
        });

        let (run, model_id) = match self.run_stage(task, Action::Fix, &input).await {
            Ok(ok) => ok,
            Err(err) => return self.handle_handler_failure(task, TaskStatus::Fixing, err).await,
        };

        let StageOutput::Fixed(output) = run.output else {
            anyhow::bail!("fixer returned a non-fix output");
        };

        if let Err(err) = self.check_diff_policy(&output.diff) {
            return self.handle_handler_failure(task, TaskStatus::Fixing, err).await;
        }

        let branch = task
            .branch_name
            .clone()
            .unwrap_or_else(|| format!("autodev/issue-{}", task.issue_number));
        task_db::set_coding_outputs(
            &self.pool,
            task.id,
            &branch,
            &output.diff,
            &output.commit_message,
        )
        .await?;
        dispatch::complete_fixing(&self.pool, task.id).await?;

        let mut event = NewTaskEvent::bare(task.id, EventType::Fixed);
        event.agent = Some(model_id);
        event.tokens_used = run.tokens_used;
        event.duration_ms = Some(run.duration.as_millis() as i32);
        event.output_summary = Some(output.fix_description.clone());
        store::append_event(&self.pool, &event).await;

        Ok(StepOutcome::Advanced)
    }

    async fn step_open_pr(&self, task: &Task) -> Result<StepOutcome> {
        if task.status != TaskStatus::TestsPassed {
            return Err(OrchestratorError::PreconditionViolation(
                "open_pr step requires passed tests".to_string(),
            )
            .into());
        }
        let branch = require_str(&task.branch_name, "open_pr step requires a branch")?;

        if task.pr_url.is_some() {
            // PR already opened (resumed step); just record the transition.
            dispatch::record_pr_opened(&self.pool, task.id).await?;
            return Ok(StepOutcome::Suspended);
        }

        let body = format!(
            "Closes {}#{}.\n\n{}",
            task.repo,
            task.issue_number,
            task.plan
                .as_deref()
                .map(|p| p.join("\n"))
                .unwrap_or_default()
        );

        let pr = match self
            .host
            .open_pull_request(
                &task.repo,
                branch,
                &self.config.base_branch,
                &task.title,
                &body,
            )
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                let failure = TaskFailure::new(FailureCode::Host, "failed to open pull request")
                    .with_cause(format!("{e:#}"))
                    .recoverable();
                self.fail_with_comment(task, &failure).await?;
                return Ok(StepOutcome::Terminal);
            }
        };

        task_db::set_pr_info(&self.pool, task.id, pr.number, &pr.url).await?;
        dispatch::record_pr_opened(&self.pool, task.id).await?;

        let mut event = NewTaskEvent::bare(task.id, EventType::PrOpened);
        event.output_summary = Some(pr.url.clone());
        event.metadata = serde_json::json!({"pr_number": pr.number});
        store::append_event(&self.pool, &event).await;

        tracing::info!(task_id = %task.id, pr_url = %pr.url, "pull request opened");
        Ok(StepOutcome::Suspended)
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    /// Select a model for the action and run its handler through the
    /// escalation ladder.
    async fn run_stage(
        &self,
        task: &Task,
        action: Action,
        input: &StageInput,
    ) -> Result<(StageRun, String), HandlerError> {
        let selection = self
            .selector
            .select(&SelectionContext {
                action,
                complexity: task.estimated_complexity,
                effort: task.estimated_effort,
                attempt_count: task.attempt_count,
            })
            .await
            .map_err(|e| HandlerError::ModelUnavailable(format!("selector: {e:#}")))?;

        let handler = match action {
            Action::Plan => StageHandler::Planner,
            Action::Code => StageHandler::Coder,
            Action::Review => StageHandler::Reviewer,
            Action::Fix => StageHandler::Fixer,
            other => {
                return Err(HandlerError::ValidationFailed(format!(
                    "no handler for action {other}"
                )));
            }
        };

        self.run_stage_with(task, handler, input, selection).await
    }

    /// Run a handler once per ladder rung until it succeeds or a
    /// non-transient error surfaces. Returns the run and the model that
    /// produced it.
    async fn run_stage_with(
        &self,
        task: &Task,
        handler: StageHandler,
        input: &StageInput,
        selection: Selection,
    ) -> Result<(StageRun, String), HandlerError> {
        let mut ladder = vec![selection.model_id.clone()];
        let remaining_rungs: &[&str] = match selection.tier {
            Tier::Standard => &["escalation_1", "escalation_2"],
            Tier::Escalation1 => &["escalation_2"],
            Tier::Escalation2 => &[],
        };
        for position in remaining_rungs {
            let model = self
                .selector
                .resolve(position)
                .await
                .map_err(|e| HandlerError::ModelUnavailable(format!("selector: {e:#}")))?;
            if !ladder.contains(&model) {
                ladder.push(model);
            }
        }

        let mut last_err: Option<HandlerError> = None;
        for model_id in &ladder {
            tracing::debug!(
                task_id = %task.id,
                handler = handler.name(),
                model = %model_id,
                "invoking stage handler"
            );
            match handler
                .run(
                    self.client.as_ref(),
                    input,
                    model_id,
                    self.config.handler_timeout,
                )
                .await
            {
                Ok(run) => return Ok((run, model_id.clone())),
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        task_id = %task.id,
                        handler = handler.name(),
                        model = %model_id,
                        error = %err,
                        "transient handler failure, escalating tier"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            HandlerError::ModelUnavailable("escalation ladder is empty".to_string())
        }))
    }

    /// Apply per-step handler-failure policy.
    ///
    /// Transient failures that survived the ladder fail the task.
    /// Validation and output failures count an attempt: planner failures
    /// are non-recoverable (the table routes `planning -> failed`), other
    /// stages route to `fixing` while attempts remain.
    async fn handle_handler_failure(
        &self,
        task: &Task,
        stage_state: TaskStatus,
        err: HandlerError,
    ) -> Result<StepOutcome> {
        let (code, counts_attempt) = match &err {
            HandlerError::ModelUnavailable(_) => (FailureCode::ModelUnavailable, false),
            HandlerError::TimedOut(_) => (FailureCode::TimedOut, false),
            HandlerError::ValidationFailed(_) => (FailureCode::ValidationFailed, true),
            HandlerError::InvalidOutput(_) => (FailureCode::InvalidOutput, true),
        };

        if !counts_attempt {
            let failure = TaskFailure::new(code, "escalation ladder exhausted")
                .with_cause(err.to_string())
                .recoverable();
            self.fail_with_comment(task, &failure).await?;
            return Ok(StepOutcome::Terminal);
        }

        task_db::set_last_error(&self.pool, task.id, &err.to_string()).await?;

        if stage_state == TaskStatus::Planning {
            let failure = TaskFailure::new(code, "planner output rejected")
                .with_cause(err.to_string());
            self.fail_with_comment(task, &failure).await?;
            return Ok(StepOutcome::Terminal);
        }

        self.retry_or_fail(task, stage_state, &err.to_string()).await
    }

    /// Count an attempt: move to `fixing` while budget remains, fail the
    /// task otherwise.
    async fn retry_or_fail(
        &self,
        task: &Task,
        from: TaskStatus,
        reason: &str,
    ) -> Result<StepOutcome> {
        if task.attempt_count < task.max_attempts {
            dispatch::begin_fixing(&self.pool, task.id, from).await?;
            tracing::info!(
                task_id = %task.id,
                attempt = task.attempt_count + 1,
                max_attempts = task.max_attempts,
                "entering fix stage"
            );
            Ok(StepOutcome::Advanced)
        } else {
            let failure = TaskFailure::new(
                FailureCode::AttemptsExhausted,
                format!("{} attempts exhausted", task.max_attempts),
            )
            .with_cause(reason.to_string());
            self.fail_with_comment(task, &failure).await?;
            Ok(StepOutcome::Terminal)
        }
    }

    /// Fail the task, optionally posting a comment on the originating
    /// issue. The comment is best-effort.
    async fn fail_with_comment(&self, task: &Task, failure: &TaskFailure) -> Result<()> {
        dispatch::fail_task(&self.pool, task.id, failure).await?;
        if self.settings.comment_on_failure {
            let body = format!(
                "autodev could not complete this issue: {}",
                failure.short_message()
            );
            if let Err(e) = self
                .host
                .post_comment(&task.repo, task.issue_number, &body)
                .await
            {
                tracing::warn!(task_id = %task.id, error = %e, "failed to post failure comment");
            }
        }
        Ok(())
    }

    /// Policy gate for generated diffs: path allowlist/blocklist and the
    /// size ceiling.
    fn check_diff_policy(&self, diff_text: &str) -> Result<(), HandlerError> {
        let files = diff::parse_unified_diff(diff_text)
            .map_err(|e| HandlerError::InvalidOutput(e.to_string()))?;

        for path in diff::touched_paths(&files) {
            if !self.settings.path_allowed(&path) {
                return Err(HandlerError::InvalidOutput(format!(
                    "diff touches disallowed path {path}"
                )));
            }
        }

        let changed = diff::changed_lines(&files);
        if changed > self.settings.max_diff_lines {
            return Err(HandlerError::InvalidOutput(format!(
                "diff changes {changed} lines, over the {} line ceiling",
                self.settings.max_diff_lines
            )));
        }
        Ok(())
    }

    /// Route step errors that escaped a stage helper.
    async fn handle_step_error(&self, task: &Task, err: anyhow::Error) -> Result<()> {
        match err.downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::InvalidStateTransition { from, to }) => {
                let failure = TaskFailure::new(
                    FailureCode::InvalidState,
                    format!("invalid transition {from} -> {to}"),
                );
                dispatch::fail_task(&self.pool, task.id, &failure).await
            }
            Some(OrchestratorError::LockConflict { expected, actual }) => {
                // Another writer moved the task; drop this step and let the
                // loop re-read.
                tracing::debug!(
                    task_id = %task.id,
                    expected = %expected,
                    actual = %actual,
                    "lost optimistic lock, re-reading"
                );
                Ok(())
            }
            Some(OrchestratorError::PreconditionViolation(msg)) => {
                let failure = TaskFailure::new(FailureCode::Precondition, msg.clone());
                self.fail_with_comment(task, &failure).await
            }
            Some(OrchestratorError::StorePermanent(_)) => {
                let failure = TaskFailure::new(FailureCode::Store, "persistent store failure")
                    .with_cause(format!("{err:#}"))
                    .recoverable();
                dispatch::fail_task(&self.pool, task.id, &failure).await
            }
            _ => {
                let failure = TaskFailure::new(FailureCode::Store, "unexpected driver error")
                    .with_cause(format!("{err:#}"))
                    .recoverable();
                dispatch::fail_task(&self.pool, task.id, &failure).await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Entering a stage the task is already in (after a crash mid-stage) is a
/// legal resume, not an error.
fn ignore_if_resumed(err: anyhow::Error, current: TaskStatus, stage: TaskStatus) -> Result<()> {
    if current == stage {
        return Ok(());
    }
    Err(err)
}

fn require_list<'a>(
    value: &'a Option<Vec<String>>,
    message: &str,
) -> Result<&'a [String], OrchestratorError> {
    match value.as_deref() {
        Some(list) if !list.is_empty() => Ok(list),
        _ => Err(OrchestratorError::PreconditionViolation(message.to_string())),
    }
}

fn require_str<'a>(
    value: &'a Option<String>,
    message: &str,
) -> Result<&'a str, OrchestratorError> {
    match value.as_deref() {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(OrchestratorError::PreconditionViolation(message.to_string())),
    }
}
