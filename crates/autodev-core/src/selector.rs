//! Model selection: maps (stage, complexity, effort, attempt count) to a
//! concrete model identifier.
//!
//! Resolution order for every position: configured row -> hardcoded
//! default table -> universal fallback. The config cache is read-mostly;
//! refresh replaces the whole map and tolerates a stale read.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::time::Instant;

use autodev_db::models::{Complexity, Effort};
use autodev_db::queries::model_configs as db;

use crate::state::Action;

/// Model used when a position is configured nowhere at all.
pub const FALLBACK_MODEL: &str = "orion-medium";

/// Hardcoded defaults, keyed by position. Overridden per position by the
/// `model_configs` table.
pub const DEFAULT_MODELS: &[(&str, &str)] = &[
    ("planner", "orion-large"),
    ("reviewer", "orion-large"),
    ("fixer", "orion-medium"),
    ("escalation_1", "orion-large"),
    ("escalation_2", "orion-max"),
    ("coder_xs_low", "orion-small"),
    ("coder_xs_medium", "orion-small"),
    ("coder_xs_high", "orion-medium"),
    ("coder_xs_default", "orion-small"),
    ("coder_s_low", "orion-small"),
    ("coder_s_medium", "orion-medium"),
    ("coder_s_high", "orion-medium"),
    ("coder_s_default", "orion-medium"),
    ("coder_m_low", "orion-medium"),
    ("coder_m_medium", "orion-medium"),
    ("coder_m_high", "orion-large"),
    ("coder_m_default", "orion-medium"),
];

/// Every valid position, for the config API's listing of what can be set.
pub fn all_positions() -> Vec<&'static str> {
    DEFAULT_MODELS.iter().map(|(p, _)| *p).collect()
}

/// Tier of the selected model, reported alongside the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Standard,
    Escalation1,
    Escalation2,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Escalation1 => "escalation_1",
            Self::Escalation2 => "escalation_2",
        };
        f.write_str(s)
    }
}

/// The selector's answer for one stage invocation.
#[derive(Debug, Clone)]
pub struct Selection {
    pub model_id: String,
    pub tier: Tier,
    pub reason: String,
    /// Set when the task is too large to attempt (complexity L/XL on the
    /// code stage); the driver suspends the task for human breakdown
    /// instead of invoking a handler.
    pub requires_breakdown: bool,
}

/// Inputs the selector consults.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub action: Action,
    pub complexity: Option<Complexity>,
    pub effort: Option<Effort>,
    pub attempt_count: i32,
}

struct Cache {
    map: HashMap<String, String>,
    refreshed_at: Option<Instant>,
}

/// Model selector with a TTL'd in-memory view of the `model_configs`
/// table.
pub struct ModelSelector {
    pool: PgPool,
    ttl: Duration,
    cache: RwLock<Cache>,
}

impl ModelSelector {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            cache: RwLock::new(Cache {
                map: HashMap::new(),
                refreshed_at: None,
            }),
        }
    }

    /// Select a model for the given context.
    ///
    /// Rules, first match wins:
    /// 1. attempt 1 -> `escalation_1`; attempt >= 2 -> `escalation_2`
    ///    (any stage).
    /// 2. Non-code stages -> the configured `planner`/`reviewer`/`fixer`
    ///    position.
    /// 3. Code stage, complexity L/XL -> no attempt; requires breakdown.
    /// 4. Code stage, first attempt -> `coder_{complexity}_{effort}`,
    ///    with `default` when effort is unspecified.
    pub async fn select(&self, ctx: &SelectionContext) -> Result<Selection> {
        if ctx.attempt_count >= 1 {
            let (position, tier) = if ctx.attempt_count == 1 {
                ("escalation_1", Tier::Escalation1)
            } else {
                ("escalation_2", Tier::Escalation2)
            };
            let model_id = self.resolve(position).await?;
            return Ok(Selection {
                reason: format!(
                    "attempt {} escalates to {position} ({model_id})",
                    ctx.attempt_count
                ),
                model_id,
                tier,
                requires_breakdown: false,
            });
        }

        let position = match ctx.action {
            Action::Plan => "planner".to_string(),
            Action::Review => "reviewer".to_string(),
            Action::Fix => "fixer".to_string(),
            Action::Code => {
                let complexity = ctx.complexity.unwrap_or(Complexity::M);
                if complexity.requires_breakdown() {
                    return Ok(Selection {
                        model_id: FALLBACK_MODEL.to_string(),
                        tier: Tier::Standard,
                        reason: "requires breakdown".to_string(),
                        requires_breakdown: true,
                    });
                }
                let effort = ctx
                    .effort
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "default".to_string());
                format!("coder_{complexity}_{effort}")
            }
            other => anyhow::bail!("no model position for action {other}"),
        };

        let model_id = self.resolve(&position).await?;
        Ok(Selection {
            reason: format!("position {position} resolves to {model_id}"),
            model_id,
            tier: Tier::Standard,
            requires_breakdown: false,
        })
    }

    /// Resolve a position through config -> default table -> fallback.
    pub async fn resolve(&self, position: &str) -> Result<String> {
        self.refresh_if_stale().await?;

        let cache = self.cache.read().await;
        if let Some(model_id) = cache.map.get(position) {
            return Ok(model_id.clone());
        }
        drop(cache);

        if let Some((_, model_id)) = DEFAULT_MODELS.iter().find(|(p, _)| *p == position) {
            return Ok((*model_id).to_string());
        }

        Ok(FALLBACK_MODEL.to_string())
    }

    /// Replace the cached map with a fresh read of the config table.
    pub async fn refresh(&self) -> Result<()> {
        let configs = db::list_model_configs(&self.pool).await?;
        let map: HashMap<String, String> = configs
            .into_iter()
            .map(|c| (c.position, c.model_id))
            .collect();

        let mut cache = self.cache.write().await;
        cache.map = map;
        cache.refreshed_at = Some(Instant::now());
        Ok(())
    }

    /// Drop the cached map so the next read refreshes. Used after a
    /// config write.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        cache.refreshed_at = None;
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        let stale = {
            let cache = self.cache.read().await;
            match cache.refreshed_at {
                None => true,
                Some(at) => at.elapsed() >= self.ttl,
            }
        };
        if stale {
            self.refresh().await?;
        }
        Ok(())
    }
}
