//! `autodev models` subcommands.

use std::collections::HashMap;

use autodev_core::selector::{all_positions, DEFAULT_MODELS};
use autodev_db::queries::model_configs as model_db;

use crate::config::AutodevConfig;
use crate::{CliError, CliResult, ModelCommands};

pub async fn run(command: ModelCommands, config: &AutodevConfig) -> CliResult {
    match command {
        ModelCommands::Show => show(config).await,
        ModelCommands::Set { position, model_id } => set(config, &position, &model_id).await,
    }
}

async fn show(config: &AutodevConfig) -> CliResult {
    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let configured: HashMap<String, String> = model_db::list_model_configs(&pool)
        .await?
        .into_iter()
        .map(|c| (c.position, c.model_id))
        .collect();

    println!("{:<20} {:<16} SOURCE", "POSITION", "MODEL");
    for (position, default_model) in DEFAULT_MODELS {
        match configured.get(*position) {
            Some(model) => println!("{position:<20} {model:<16} configured"),
            None => println!("{position:<20} {default_model:<16} default"),
        }
    }
    Ok(())
}

async fn set(config: &AutodevConfig, position: &str, model_id: &str) -> CliResult {
    if !all_positions().contains(&position) {
        return Err(CliError::generic(anyhow::anyhow!(
            "unknown position {position:?}; valid positions: {}",
            all_positions().join(", ")
        )));
    }

    let pool = autodev_db::pool::create_pool(&config.db_config)
        .await
        .map_err(CliError::config)?;
    let updated = model_db::set_model_config(&pool, position, model_id).await?;
    println!("{} -> {}", updated.position, updated.model_id);
    Ok(())
}
