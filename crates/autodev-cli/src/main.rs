mod config;
mod job_cmds;
mod model_cmds;
mod runtime;
mod serve_cmd;
mod status_cmd;
mod task_cmds;

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::AutodevConfig;

/// Exit codes for scripting: 0 success, 1 generic error, 2 config error,
/// 3 allowlist violation, 4 budget exceeded.
pub const EXIT_GENERIC: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_ALLOWLIST: u8 = 3;
pub const EXIT_BUDGET: u8 = 4;

/// A CLI failure tagged with its exit code.
#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub error: anyhow::Error,
}

impl CliError {
    pub fn generic(error: anyhow::Error) -> Self {
        Self {
            code: EXIT_GENERIC,
            error,
        }
    }

    pub fn config(error: anyhow::Error) -> Self {
        Self {
            code: EXIT_CONFIG,
            error,
        }
    }

    pub fn allowlist(repo: &str) -> Self {
        Self {
            code: EXIT_ALLOWLIST,
            error: anyhow::anyhow!("repo {repo} is not on the allowlist"),
        }
    }

    pub fn budget(error: anyhow::Error) -> Self {
        Self {
            code: EXIT_BUDGET,
            error,
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(error: anyhow::Error) -> Self {
        Self::generic(error)
    }
}

pub type CliResult = Result<(), CliError>;

#[derive(Parser)]
#[command(name = "autodev", about = "Autonomous code-change orchestrator: issues in, pull requests out")]
struct Cli {
    /// Database URL (overrides AUTODEV_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an autodev config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/autodev")]
        db_url: String,
        /// Repos to allow, comma-separated owner/name pairs
        #[arg(long)]
        allow_repos: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the autodev database (creates it and runs migrations)
    DbInit,
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Model configuration
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
    /// Show task and job counts
    Status,
    /// Run the HTTP API and webhook ingress
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8600)]
        port: u16,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task from a repository issue
    Create {
        /// Repository as owner/name
        repo: String,
        /// Issue number
        issue_number: i32,
        /// Issue title (fetched from the source host when omitted)
        #[arg(long)]
        title: Option<String>,
        /// Issue body
        #[arg(long)]
        body: Option<String>,
    },
    /// List all tasks
    List,
    /// Show one task in full
    Show {
        /// Task ID
        task_id: String,
    },
    /// Show the event log for a task
    Events {
        /// Task ID
        task_id: String,
    },
    /// Drive a task until it suspends or terminates
    Start {
        /// Task ID
        task_id: String,
    },
    /// Cancel a task
    Cancel {
        /// Task ID
        task_id: String,
    },
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Create a job from a set of issues
    Create {
        /// Repository as owner/name
        repo: String,
        /// Comma-separated issue numbers (e.g. "12,14,15")
        #[arg(long)]
        issues: String,
    },
    /// List all jobs
    List,
    /// Show one job with its summary
    Show {
        /// Job ID
        job_id: String,
    },
    /// Run a job's tasks with bounded concurrency
    Run {
        /// Job ID
        job_id: String,
        /// Maximum concurrently driven tasks
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Stop scheduling on the first failed task
        #[arg(long)]
        stop_on_error: bool,
    },
    /// Cancel a job
    Cancel {
        /// Job ID
        job_id: String,
    },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// Show configured and default models per position
    Show,
    /// Set the model for a position
    Set {
        /// Position (e.g. planner, coder_xs_low, escalation_1)
        position: String,
        /// Model identifier
        model_id: String,
    },
}

async fn run(cli: Cli) -> CliResult {
    match cli.command {
        Commands::Init {
            db_url,
            allow_repos,
            force,
        } => init_cmd(&db_url, allow_repos.as_deref(), force),
        Commands::DbInit => db_init_cmd(cli.database_url.as_deref()).await,
        Commands::Task { command } => {
            let config = resolve_config(cli.database_url.as_deref())?;
            task_cmds::run(command, &config).await
        }
        Commands::Job { command } => {
            let config = resolve_config(cli.database_url.as_deref())?;
            job_cmds::run(command, &config).await
        }
        Commands::Models { command } => {
            let config = resolve_config(cli.database_url.as_deref())?;
            model_cmds::run(command, &config).await
        }
        Commands::Status => {
            let config = resolve_config(cli.database_url.as_deref())?;
            status_cmd::run(&config).await
        }
        Commands::Serve { bind, port } => {
            let config = resolve_config(cli.database_url.as_deref())?;
            let state = runtime::build_state(&config)
                .await
                .map_err(CliError::config)?;
            serve_cmd::run_serve(state, &bind, port)
                .await
                .map_err(CliError::generic)
        }
    }
}

fn resolve_config(cli_db_url: Option<&str>) -> Result<AutodevConfig, CliError> {
    AutodevConfig::resolve(cli_db_url).map_err(CliError::config)
}

fn init_cmd(db_url: &str, allow_repos: Option<&str>, force: bool) -> CliResult {
    let path = config::config_path();
    if path.exists() && !force {
        return Err(CliError::config(anyhow::anyhow!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        )));
    }

    let mut file = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        ..Default::default()
    };
    if let Some(repos) = allow_repos {
        file.orchestrator.allowed_repos = repos
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
    }

    config::save_config(&file).map_err(CliError::config)?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn db_init_cmd(cli_db_url: Option<&str>) -> CliResult {
    let config = resolve_config(cli_db_url)?;
    let created = autodev_db::pool::ensure_database_exists(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    autodev_db::pool::run_migrations(&pool)
        .await
        .map_err(CliError::config)?;
    if created {
        println!("database created and migrated at {}", config.db_config.database_url);
    } else {
        println!("database ready at {}", config.db_config.database_url);
    }
    Ok(())
}

pub fn parse_uuid(raw: &str) -> Result<uuid::Uuid, CliError> {
    uuid::Uuid::parse_str(raw)
        .with_context(|| format!("{raw:?} is not a valid ID"))
        .map_err(CliError::generic)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e.error);
            ExitCode::from(e.code)
        }
    }
}
