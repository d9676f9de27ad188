//! Process-wide orchestrator settings.
//!
//! Loaded once at startup (from the config file or defaults) and treated as
//! immutable for the life of the process. Never mutated from inside a
//! driver step.

use serde::{Deserialize, Serialize};

fn default_auto_dev_label() -> String {
    "auto-dev".to_string()
}

fn default_batch_label() -> String {
    "auto-dev-batch".to_string()
}

fn default_max_attempts() -> i32 {
    3
}

fn default_max_diff_lines() -> usize {
    400
}

fn default_max_parallel() -> usize {
    3
}

fn default_batch_timeout_minutes() -> u64 {
    30
}

fn default_min_batch_size() -> usize {
    2
}

fn default_max_batch_size() -> usize {
    10
}

fn default_model_config_ttl_seconds() -> u64 {
    60
}

/// Orchestrator settings, deserializable from the `[orchestrator]` section
/// of the config file. Every field has a default so a minimal config file
/// works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Repositories ("owner/name") the orchestrator may act on. Events for
    /// unlisted repos are dropped silently.
    #[serde(default)]
    pub allowed_repos: Vec<String>,

    /// Path prefixes a diff may touch. Empty means everything not blocked.
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// Path prefixes a diff may never touch. Takes precedence over
    /// `allowed_paths`.
    #[serde(default)]
    pub blocked_paths: Vec<String>,

    /// Label that turns an issue into a solo task.
    #[serde(default = "default_auto_dev_label")]
    pub auto_dev_label: String,

    /// Label that groups sibling issues into one job.
    #[serde(default = "default_batch_label")]
    pub batch_label: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_max_diff_lines")]
    pub max_diff_lines: usize,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default = "default_batch_timeout_minutes")]
    pub batch_timeout_minutes: u64,

    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Post a comment on the originating issue when a task fails.
    #[serde(default)]
    pub comment_on_failure: bool,

    #[serde(default = "default_model_config_ttl_seconds")]
    pub model_config_ttl_seconds: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            allowed_repos: Vec::new(),
            allowed_paths: Vec::new(),
            blocked_paths: Vec::new(),
            auto_dev_label: default_auto_dev_label(),
            batch_label: default_batch_label(),
            max_attempts: default_max_attempts(),
            max_diff_lines: default_max_diff_lines(),
            max_parallel: default_max_parallel(),
            batch_timeout_minutes: default_batch_timeout_minutes(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            comment_on_failure: false,
            model_config_ttl_seconds: default_model_config_ttl_seconds(),
        }
    }
}

impl OrchestratorSettings {
    /// Whether the allowlist admits this repo.
    pub fn repo_allowed(&self, repo: &str) -> bool {
        self.allowed_repos.iter().any(|r| r == repo)
    }

    /// Whether a diff may touch this path. Blocked prefixes always deny;
    /// when `allowed_paths` is non-empty the path must match one of them.
    pub fn path_allowed(&self, path: &str) -> bool {
        if self.blocked_paths.iter().any(|p| path.starts_with(p)) {
            return false;
        }
        if self.allowed_paths.is_empty() {
            return true;
        }
        self.allowed_paths.iter().any(|p| path.starts_with(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = OrchestratorSettings::default();
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.max_diff_lines, 400);
        assert_eq!(s.max_parallel, 3);
        assert_eq!(s.batch_timeout_minutes, 30);
        assert_eq!(s.min_batch_size, 2);
        assert_eq!(s.max_batch_size, 10);
        assert_eq!(s.model_config_ttl_seconds, 60);
        assert!(!s.comment_on_failure);
    }

    #[test]
    fn repo_allowlist_is_exact_match() {
        let s = OrchestratorSettings {
            allowed_repos: vec!["acme/widgets".to_string()],
            ..Default::default()
        };
        assert!(s.repo_allowed("acme/widgets"));
        assert!(!s.repo_allowed("acme/widgets-fork"));
        assert!(!s.repo_allowed("other/repo"));
    }

    #[test]
    fn blocked_paths_take_precedence() {
        let s = OrchestratorSettings {
            allowed_paths: vec!["src/".to_string()],
            blocked_paths: vec!["src/secrets/".to_string()],
            ..Default::default()
        };
        assert!(s.path_allowed("src/main.rs"));
        assert!(!s.path_allowed("src/secrets/keys.txt"));
        assert!(!s.path_allowed("docs/readme.md"));
    }

    #[test]
    fn empty_allowed_paths_means_everything_not_blocked() {
        let s = OrchestratorSettings {
            blocked_paths: vec![".github/".to_string()],
            ..Default::default()
        };
        assert!(s.path_allowed("anything/at/all.rs"));
        assert!(!s.path_allowed(".github/workflows/ci.yml"));
    }

    #[test]
    fn minimal_toml_deserializes_with_defaults() {
        let s: OrchestratorSettings =
            serde_json::from_str(r#"{"allowed_repos": ["acme/widgets"]}"#).unwrap();
        assert_eq!(s.auto_dev_label, "auto-dev");
        assert_eq!(s.batch_label, "auto-dev-batch");
        assert_eq!(s.max_attempts, 3);
    }
}
