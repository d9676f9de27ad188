//! Connection pooling and schema management.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Open a pool against the configured database.
///
/// The size cap comes from [`DbConfig::max_connections`] so short-lived
/// CLI invocations and the long-lived server can tune it independently.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// This crate's `migrations/` directory, resolved at compile time.
fn migrations_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Apply any pending schema migrations.
///
/// The migration set is loaded at runtime, so building the workspace
/// never needs a live database (unlike the `sqlx::migrate!()` macro).
/// sqlx's `_sqlx_migrations` bookkeeping makes re-runs a no-op.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let dir = migrations_dir();
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    let known = migrator.iter().count();
    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!(migrations = known, "schema is up to date");
    Ok(())
}

/// `CREATE DATABASE` cannot take a bind parameter, so names are
/// interpolated after passing this shape check: lowercase identifier,
/// no leading digit.
fn is_safe_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    let leading_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    leading_ok && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Create the configured database when it is missing.
///
/// Connects to the maintenance database on the same server and issues
/// `CREATE DATABASE`. Returns `true` when a database was created,
/// `false` when it already existed.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;
    if !is_safe_database_name(db_name) {
        bail!("database name {db_name:?} is not a plain lowercase identifier");
    }

    let maintenance_url = config.maintenance_url();
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maint_pool)
            .await
            .context("failed to query pg_database")?;

    let created = if exists {
        false
    } else {
        maint_pool
            .execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        true
    };
    maint_pool.close().await;

    info!(db = db_name, created, "database ready");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_are_safe() {
        assert!(is_safe_database_name("autodev"));
        assert!(is_safe_database_name("autodev_test_3f2a"));
        assert!(is_safe_database_name("_scratch"));
    }

    #[test]
    fn injection_shaped_names_are_rejected() {
        assert!(!is_safe_database_name(""));
        assert!(!is_safe_database_name("3leading_digit"));
        assert!(!is_safe_database_name("Upper"));
        assert!(!is_safe_database_name("db;DROP DATABASE postgres"));
        assert!(!is_safe_database_name("db name"));
        assert!(!is_safe_database_name("db-name"));
    }

    #[test]
    fn migrations_dir_points_into_this_crate() {
        let dir = migrations_dir();
        assert!(
            dir.ends_with("autodev-db/migrations"),
            "unexpected migrations dir: {}",
            dir.display()
        );
    }
}
