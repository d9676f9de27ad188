//! `autodev job` subcommands.

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use autodev_core::runner::{self, JobOutcome, JobRunnerConfig};
use autodev_db::models::JobStatus;
use autodev_db::queries::jobs as job_db;

use crate::config::AutodevConfig;
use crate::runtime;
use crate::{parse_uuid, CliError, CliResult, JobCommands};

pub async fn run(command: JobCommands, config: &AutodevConfig) -> CliResult {
    match command {
        JobCommands::Create { repo, issues } => create(config, &repo, &issues).await,
        JobCommands::List => list(config).await,
        JobCommands::Show { job_id } => show(config, &job_id).await,
        JobCommands::Run {
            job_id,
            max_parallel,
            stop_on_error,
        } => run_job(config, &job_id, max_parallel, stop_on_error).await,
        JobCommands::Cancel { job_id } => cancel(config, &job_id).await,
    }
}

fn parse_issue_list(raw: &str) -> Result<Vec<i32>, CliError> {
    let issues: Result<Vec<i32>, _> = raw
        .split(',')
        .map(|part| part.trim().parse::<i32>())
        .collect();
    let issues = issues
        .with_context(|| format!("could not parse issue list {raw:?}"))
        .map_err(CliError::generic)?;
    if issues.is_empty() {
        return Err(CliError::generic(anyhow::anyhow!("issue list is empty")));
    }
    Ok(issues)
}

async fn create(config: &AutodevConfig, repo: &str, issues: &str) -> CliResult {
    if !config.settings.repo_allowed(repo) {
        return Err(CliError::allowlist(repo));
    }
    let issue_numbers = parse_issue_list(issues)?;

    let state = runtime::build_state(config).await.map_err(CliError::config)?;
    let job = job_db::insert_job(&state.pool, repo, &[]).await?;

    for issue_number in &issue_numbers {
        let (title, body) = match state.host.fetch_issue(repo, *issue_number).await {
            Ok(issue) => (issue.title, issue.body),
            Err(_) => (format!("issue #{issue_number}"), String::new()),
        };
        let task = state
            .ingress
            .create_task(repo, *issue_number, &title, &body, Some(job.id))
            .await?;
        job_db::append_task_to_job(&state.pool, job.id, task.id).await?;
    }
    autodev_core::store::refresh_job_summary(&state.pool, job.id).await?;

    println!(
        "created job {} with {} task(s) for {repo}",
        job.id,
        issue_numbers.len()
    );
    Ok(())
}

async fn list(config: &AutodevConfig) -> CliResult {
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let jobs = job_db::list_jobs(&pool).await?;

    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    println!("{:<38} {:<24} {:<10} {}", "ID", "REPO", "STATUS", "PROGRESS");
    for job in jobs {
        let s = &job.summary.0;
        println!(
            "{:<38} {:<24} {:<10} {}/{} done, {} failed",
            job.id, job.repo, job.status.to_string(), s.completed, s.total, s.failed
        );
    }
    Ok(())
}

async fn show(config: &AutodevConfig, job_id: &str) -> CliResult {
    let id = parse_uuid(job_id)?;
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let job = job_db::get_job(&pool, id)
        .await?
        .with_context(|| format!("job {id} not found"))?;

    println!("{}", serde_json::to_string_pretty(&job).unwrap_or_default());
    Ok(())
}

async fn run_job(
    config: &AutodevConfig,
    job_id: &str,
    max_parallel: Option<usize>,
    stop_on_error: bool,
) -> CliResult {
    let id = parse_uuid(job_id)?;
    let state = runtime::build_state(config).await.map_err(CliError::config)?;

    let runner_config = JobRunnerConfig {
        max_parallel: max_parallel.unwrap_or(config.settings.max_parallel),
        continue_on_error: !stop_on_error,
    };

    let cancel = CancellationToken::new();
    let outcome = runner::run_job(
        &state.pool,
        id,
        state.driver.clone(),
        state.coalescer.clone(),
        state.host.clone(),
        &runner_config,
        cancel,
    )
    .await?;

    match outcome {
        JobOutcome::Completed => {
            println!("job {id} completed");
            Ok(())
        }
        JobOutcome::Partial { failed_tasks } => {
            println!("job {id} partial: {} task(s) failed", failed_tasks.len());
            Ok(())
        }
        JobOutcome::AwaitingExternal { suspended_tasks } => {
            println!(
                "job {id} waiting on {} suspended task(s); resume via webhook events",
                suspended_tasks.len()
            );
            Ok(())
        }
        JobOutcome::Failed { failed_tasks } => Err(CliError::generic(anyhow::anyhow!(
            "job {id} failed: {} task(s) failed",
            failed_tasks.len()
        ))),
        JobOutcome::Cancelled => Err(CliError::generic(anyhow::anyhow!("job {id} cancelled"))),
    }
}

async fn cancel(config: &AutodevConfig, job_id: &str) -> CliResult {
    let id = parse_uuid(job_id)?;
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;

    let job = job_db::get_job(&pool, id)
        .await?
        .with_context(|| format!("job {id} not found"))?;

    let rows = match job.status {
        JobStatus::Pending => {
            job_db::transition_job_status(&pool, id, JobStatus::Pending, JobStatus::Cancelled)
                .await?
        }
        JobStatus::Running => {
            job_db::transition_job_status(&pool, id, JobStatus::Running, JobStatus::Cancelled)
                .await?
        }
        other => {
            return Err(CliError::generic(anyhow::anyhow!(
                "job {id} is already {other}"
            )));
        }
    };

    if rows == 0 {
        return Err(CliError::generic(anyhow::anyhow!(
            "job {id} changed status concurrently; try again"
        )));
    }
    println!("cancelled job {id}");
    Ok(())
}
