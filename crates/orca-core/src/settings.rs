//! Runtime-tunable scheduler settings.
//!
//! The CLI resolves initial values (flag > env > config file > default) and
//! the API's `POST /api/config` patches them live; every tick reads the
//! current snapshot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Tunable knobs for the dispatch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum tasks in `dispatched`/`running` at once.
    pub concurrency_cap: i64,
    /// Rolling window over which spend is summed, in hours.
    pub budget_window_hours: i64,
    /// Spend cap over the rolling window, in USD.
    pub budget_max_cost_usd: f64,
    /// Wall-clock limit per agent session, in minutes.
    pub session_timeout_min: i64,
    /// Failures a task may accumulate before it is permanently failed.
    pub max_retries: i64,
    /// Scheduler tick cadence, in seconds.
    pub tick_interval_secs: u64,
    /// Minimum age before a `orca/*` branch may be garbage-collected.
    pub cleanup_branch_max_age_min: i64,
    /// Cleanup sweep cadence, in minutes.
    pub cleanup_interval_min: u64,
    /// Turn cap passed to the agent.
    pub max_turns: u32,
    /// Agent executable path or name.
    pub agent_executable: String,
    /// Dispatch ban length after a platform-transient worktree failure.
    pub repo_cooldown_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency_cap: 3,
            budget_window_hours: 4,
            budget_max_cost_usd: 50.0,
            session_timeout_min: 30,
            max_retries: 2,
            tick_interval_secs: 10,
            cleanup_branch_max_age_min: 60,
            cleanup_interval_min: 30,
            max_turns: 50,
            agent_executable: "claude".to_string(),
            repo_cooldown_secs: 30,
        }
    }
}

/// Partial override, as accepted by `POST /api/config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub concurrency_cap: Option<i64>,
    pub budget_window_hours: Option<i64>,
    pub budget_max_cost_usd: Option<f64>,
    pub session_timeout_min: Option<i64>,
    pub max_retries: Option<i64>,
    pub tick_interval_secs: Option<u64>,
    pub cleanup_branch_max_age_min: Option<i64>,
    pub max_turns: Option<u32>,
}

impl Settings {
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(v) = patch.concurrency_cap {
            self.concurrency_cap = v;
        }
        if let Some(v) = patch.budget_window_hours {
            self.budget_window_hours = v;
        }
        if let Some(v) = patch.budget_max_cost_usd {
            self.budget_max_cost_usd = v;
        }
        if let Some(v) = patch.session_timeout_min {
            self.session_timeout_min = v;
        }
        if let Some(v) = patch.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = patch.tick_interval_secs {
            self.tick_interval_secs = v;
        }
        if let Some(v) = patch.cleanup_branch_max_age_min {
            self.cleanup_branch_max_age_min = v;
        }
        if let Some(v) = patch.max_turns {
            self.max_turns = v;
        }
    }
}

/// Shared settings handle; cheap to clone into every component.
pub type SharedSettings = Arc<RwLock<Settings>>;

pub fn shared(settings: Settings) -> SharedSettings {
    Arc::new(RwLock::new(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overrides_only_given_fields() {
        let mut settings = Settings::default();
        settings.apply(&SettingsPatch {
            concurrency_cap: Some(8),
            budget_max_cost_usd: Some(120.0),
            ..Default::default()
        });

        assert_eq!(settings.concurrency_cap, 8);
        assert_eq!(settings.budget_max_cost_usd, 120.0);
        assert_eq!(settings.session_timeout_min, 30);
        assert_eq!(settings.tick_interval_secs, 10);
    }

    #[test]
    fn patch_deserializes_from_partial_json() {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"concurrency_cap": 5}"#).unwrap();
        assert_eq!(patch.concurrency_cap, Some(5));
        assert!(patch.max_turns.is_none());
    }
}
