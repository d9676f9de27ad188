//! Database query functions for the `model_configs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::ModelConfig;

/// Get the configured model for a position, if any.
pub async fn get_model_config(pool: &PgPool, position: &str) -> Result<Option<ModelConfig>> {
    let config =
        sqlx::query_as::<_, ModelConfig>("SELECT * FROM model_configs WHERE position = $1")
            .bind(position)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to fetch model config for {position}"))?;

    Ok(config)
}

/// Set (upsert) the model for a position.
pub async fn set_model_config(pool: &PgPool, position: &str, model_id: &str) -> Result<ModelConfig> {
    let config = sqlx::query_as::<_, ModelConfig>(
        "INSERT INTO model_configs (position, model_id) \
         VALUES ($1, $2) \
         ON CONFLICT (position) \
         DO UPDATE SET model_id = EXCLUDED.model_id, updated_at = now() \
         RETURNING *",
    )
    .bind(position)
    .bind(model_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to set model config for {position}"))?;

    Ok(config)
}

/// List all configured positions, alphabetically.
pub async fn list_model_configs(pool: &PgPool) -> Result<Vec<ModelConfig>> {
    let configs =
        sqlx::query_as::<_, ModelConfig>("SELECT * FROM model_configs ORDER BY position ASC")
            .fetch_all(pool)
            .await
            .context("failed to list model configs")?;

    Ok(configs)
}
