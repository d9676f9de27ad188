//! Configuration file management for autodev.
//!
//! Provides a TOML-based config file at `~/.config/autodev/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use autodev_core::settings::OrchestratorSettings;
use autodev_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_string(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the autodev config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/autodev` or
/// `~/.config/autodev`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("autodev");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("autodev")
}

/// Return the path to the autodev config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct AutodevConfig {
    pub db_config: DbConfig,
    pub settings: OrchestratorSettings,
}

impl AutodevConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `AUTODEV_DATABASE_URL` env >
    ///   `config_file.database.url` > `DbConfig::DEFAULT_URL`.
    /// - Pool sizing comes from the environment
    ///   (`AUTODEV_DB_MAX_CONNECTIONS`) via [`DbConfig::from_env`].
    /// - Orchestrator settings come from the config file, with defaults
    ///   when the file is absent.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        // Start from the environment (URL + pool cap), then let the CLI
        // flag or the config file override the URL.
        let mut db_config = DbConfig::from_env();
        if let Some(url) = cli_db_url {
            db_config.database_url = url.to_string();
        } else if std::env::var("AUTODEV_DATABASE_URL").is_err() {
            if let Some(ref cfg) = file_config {
                db_config.database_url = cfg.database.url.clone();
            }
        }

        let settings = file_config
            .map(|cfg| cfg.orchestrator)
            .unwrap_or_default();

        Ok(Self {
            db_config,
            settings,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
