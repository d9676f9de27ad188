//! Database connection settings.

use std::env;

/// Where and how autodev connects to PostgreSQL.
///
/// Connection URLs may carry query parameters (`?sslmode=require`); the
/// helpers below keep them intact when deriving related URLs.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full connection URL.
    pub database_url: String,
    /// Pool size cap. The CLI keeps this small; `autodev serve` raises it
    /// to cover concurrent task drivers.
    pub max_connections: u32,
}

impl DbConfig {
    /// Connection URL used when nothing is configured.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/autodev";

    /// Default pool size cap.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

    /// Build a config from the environment: `AUTODEV_DATABASE_URL` for the
    /// URL and `AUTODEV_DB_MAX_CONNECTIONS` for the pool cap, with
    /// defaults for both.
    pub fn from_env() -> Self {
        let database_url =
            env::var("AUTODEV_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let max_connections = env::var("AUTODEV_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Self::DEFAULT_MAX_CONNECTIONS);
        Self {
            database_url,
            max_connections,
        }
    }

    /// Build a config from an explicit URL (tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Override the pool size cap.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// The database name named by the URL, with query parameters and
    /// fragments stripped. `None` when the URL has no path component.
    pub fn database_name(&self) -> Option<&str> {
        let last_segment = self.database_url.rsplit('/').next()?;
        let name = last_segment
            .split(['?', '#'])
            .next()
            .unwrap_or(last_segment);
        (!name.is_empty()).then_some(name)
    }

    /// The same server, pointed at the `postgres` maintenance database.
    ///
    /// Used to issue `CREATE DATABASE` before the target database exists.
    /// Query parameters carry over so TLS settings survive the swap.
    pub fn maintenance_url(&self) -> String {
        let Some(slash) = self.database_url.rfind('/') else {
            return self.database_url.clone();
        };
        let (server, last_segment) = self.database_url.split_at(slash);
        let params = match last_segment.find('?') {
            Some(q) => &last_segment[q..],
            None => "",
        };
        format!("{server}/postgres{params}")
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_the_default_pool_cap() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL);
        assert_eq!(cfg.database_url, "postgresql://localhost:5432/autodev");
        assert_eq!(cfg.max_connections, DbConfig::DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn with_max_connections_overrides_the_cap() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL).with_max_connections(20);
        assert_eq!(cfg.max_connections, 20);
    }

    #[test]
    fn database_name_plain() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mydb");
        assert_eq!(cfg.database_name(), Some("mydb"));
    }

    #[test]
    fn database_name_strips_query_parameters() {
        let cfg = DbConfig::new("postgresql://db.internal:5432/autodev?sslmode=require");
        assert_eq!(cfg.database_name(), Some("autodev"));
    }

    #[test]
    fn database_name_missing_is_none() {
        let cfg = DbConfig::new("postgresql://localhost:5432/");
        assert_eq!(cfg.database_name(), None);
    }

    #[test]
    fn maintenance_url_swaps_only_the_database() {
        let cfg = DbConfig::new("postgresql://localhost:5432/autodev");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://localhost:5432/postgres"
        );
    }

    #[test]
    fn maintenance_url_keeps_query_parameters() {
        let cfg = DbConfig::new("postgresql://db.internal:5432/autodev?sslmode=require");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://db.internal:5432/postgres?sslmode=require"
        );
    }
}
