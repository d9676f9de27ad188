//! `autodev status`: one-screen overview of tasks and jobs.

use std::collections::BTreeMap;

use autodev_db::queries::{jobs as job_db, tasks as task_db};

use crate::config::AutodevConfig;
use crate::{CliError, CliResult};

pub async fn run(config: &AutodevConfig) -> CliResult {
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;

    let tasks = task_db::list_tasks(&pool).await?;
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for task in &tasks {
        *by_status.entry(task.status.to_string()).or_default() += 1;
    }

    println!("tasks: {}", tasks.len());
    for (status, count) in &by_status {
        println!("  {status:<16} {count}");
    }

    let jobs = job_db::list_jobs(&pool).await?;
    println!("jobs: {}", jobs.len());
    for job in &jobs {
        let s = &job.summary.0;
        println!(
            "  {} {:<10} {}/{} done, {} failed, {} PR(s)",
            job.id,
            job.status.to_string(),
            s.completed,
            s.total,
            s.failed,
            s.prs_created.len()
        );
    }
    Ok(())
}
