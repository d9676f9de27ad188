//! `autodev task` subcommands.

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use autodev_core::error::{FailureCode, TaskFailure};
use autodev_core::state::dispatch;
use autodev_db::models::TaskStatus;
use autodev_db::queries::{task_events as event_db, tasks as task_db};

use crate::config::AutodevConfig;
use crate::runtime;
use crate::{parse_uuid, CliError, CliResult, TaskCommands, EXIT_BUDGET};

pub async fn run(command: TaskCommands, config: &AutodevConfig) -> CliResult {
    match command {
        TaskCommands::Create {
            repo,
            issue_number,
            title,
            body,
        } => create(config, &repo, issue_number, title, body).await,
        TaskCommands::List => list(config).await,
        TaskCommands::Show { task_id } => show(config, &task_id).await,
        TaskCommands::Events { task_id } => events(config, &task_id).await,
        TaskCommands::Start { task_id } => start(config, &task_id).await,
        TaskCommands::Cancel { task_id } => cancel(config, &task_id).await,
    }
}

async fn create(
    config: &AutodevConfig,
    repo: &str,
    issue_number: i32,
    title: Option<String>,
    body: Option<String>,
) -> CliResult {
    if !config.settings.repo_allowed(repo) {
        return Err(CliError::allowlist(repo));
    }

    let state = runtime::build_state(config).await.map_err(CliError::config)?;

    let (title, body) = match title {
        Some(title) => (title, body.unwrap_or_default()),
        None => {
            let issue = state
                .host
                .fetch_issue(repo, issue_number)
                .await
                .context("could not fetch the issue; pass --title and --body instead")?;
            (issue.title, issue.body)
        }
    };

    let task = state
        .ingress
        .create_task(repo, issue_number, &title, &body, None)
        .await?;

    println!("created task {} for {}#{}", task.id, repo, issue_number);
    Ok(())
}

async fn list(config: &AutodevConfig) -> CliResult {
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let tasks = task_db::list_tasks(&pool).await?;

    if tasks.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    println!(
        "{:<38} {:<24} {:<16} {:>3}  {}",
        "ID", "REPO#ISSUE", "STATUS", "ATT", "TITLE"
    );
    for task in tasks {
        println!(
            "{:<38} {:<24} {:<16} {:>3}  {}",
            task.id,
            format!("{}#{}", task.repo, task.issue_number),
            task.status.to_string(),
            task.attempt_count,
            task.title
        );
    }
    Ok(())
}

async fn show(config: &AutodevConfig, task_id: &str) -> CliResult {
    let id = parse_uuid(task_id)?;
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let task = task_db::get_task(&pool, id)
        .await?
        .with_context(|| format!("task {id} not found"))?;

    println!("{}", serde_json::to_string_pretty(&task).unwrap_or_default());
    Ok(())
}

async fn events(config: &AutodevConfig, task_id: &str) -> CliResult {
    let id = parse_uuid(task_id)?;
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let events = event_db::list_events_for_task(&pool, id).await?;

    if events.is_empty() {
        println!("no events for task {id}");
        return Ok(());
    }
    for event in events {
        let agent = event.agent.as_deref().unwrap_or("-");
        let summary = event.output_summary.as_deref().unwrap_or("");
        println!(
            "{}  {:<10} {:<14} {}",
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.event_type.to_string(),
            agent,
            summary
        );
    }
    Ok(())
}

async fn start(config: &AutodevConfig, task_id: &str) -> CliResult {
    let id = parse_uuid(task_id)?;
    let state = runtime::build_state(config).await.map_err(CliError::config)?;

    let cancel = CancellationToken::new();
    let status = state.driver.run_task(id, &cancel).await?;
    println!("task {id} left in status {status}");

    if status == TaskStatus::Failed {
        let task = task_db::get_task(&state.pool, id).await?;
        if let Some(last_error) = task.and_then(|t| t.last_error) {
            if last_error.starts_with("BUDGET_EXCEEDED") {
                return Err(CliError {
                    code: EXIT_BUDGET,
                    error: anyhow::anyhow!("{last_error}"),
                });
            }
            return Err(CliError::generic(anyhow::anyhow!("{last_error}")));
        }
        return Err(CliError::generic(anyhow::anyhow!("task failed")));
    }
    Ok(())
}

async fn cancel(config: &AutodevConfig, task_id: &str) -> CliResult {
    let id = parse_uuid(task_id)?;
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;

    let task = task_db::get_task(&pool, id)
        .await?
        .with_context(|| format!("task {id} not found"))?;
    if task.status.is_terminal() {
        return Err(CliError::generic(anyhow::anyhow!(
            "task {id} is already {}",
            task.status
        )));
    }

    let failure = TaskFailure::new(FailureCode::Cancelled, "cancelled via CLI").recoverable();
    dispatch::fail_task(&pool, id, &failure).await?;
    println!("cancelled task {id}");
    Ok(())
}
