//! Engine configuration types for Stepwise.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! history retention, default timeouts, and event bus sizing.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How much execution history each workflow retains.
    #[serde(default)]
    pub history_retention: HistoryRetention,

    /// Step timeout used when neither the step nor the workflow sets one.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Workflow timeout used when the workflow config does not set one.
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_workflow_timeout_secs: u64,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Maximum nesting of sub-workflow steps.
    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Upper bound on a human task without an explicit step timeout.
    #[serde(default = "default_human_task_timeout_secs")]
    pub human_task_timeout_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_human_task_timeout_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_retention: HistoryRetention::default(),
            default_step_timeout_secs: default_step_timeout_secs(),
            default_workflow_timeout_secs: default_workflow_timeout_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            human_task_timeout_secs: default_human_task_timeout_secs(),
        }
    }
}

/// Retention limits for the execution history embedded in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRetention {
    /// Keep at most this many executions (oldest evicted first).
    #[serde(default = "default_max_executions")]
    pub max_executions: usize,
    /// Evict terminal executions older than this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

fn default_max_executions() -> usize {
    100
}

impl Default for HistoryRetention {
    fn default() -> Self {
        Self {
            max_executions: default_max_executions(),
            max_age_days: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.history_retention.max_executions, 100);
        assert!(config.history_retention.max_age_days.is_none());
        assert_eq!(config.default_step_timeout_secs, 300);
        assert_eq!(config.default_workflow_timeout_secs, 1800);
        assert_eq!(config.event_bus_capacity, 1024);
        assert_eq!(config.max_sub_workflow_depth, 5);
        assert_eq!(config.human_task_timeout_secs, 604_800);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.history_retention.max_executions, 100);
        assert_eq!(config.event_bus_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
default_step_timeout_secs = 60
max_sub_workflow_depth = 2

[history_retention]
max_executions = 10
max_age_days = 30
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_step_timeout_secs, 60);
        assert_eq!(config.max_sub_workflow_depth, 2);
        assert_eq!(config.history_retention.max_executions, 10);
        assert_eq!(config.history_retention.max_age_days, Some(30));
        // Untouched fields keep their defaults.
        assert_eq!(config.default_workflow_timeout_secs, 1800);
    }
}
