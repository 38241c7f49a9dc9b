//! Workflow definition parsing, validation, lifecycle, and filesystem operations.
//!
//! Converts between YAML/JSON documents and the canonical `WorkflowDefinition`,
//! validates structural constraints (unique IDs, resolvable references,
//! acyclic step graph), and applies the aggregate's lifecycle rules:
//! structural edits bump the version, and workflows with history are
//! archived rather than deleted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use stepwise_types::workflow::{
    StepConfig, StepDefinition, Trigger, WorkflowDefinition, WorkflowStatus, WorkflowType,
};
use thiserror::Error;

use super::dag::validate_dag;
use super::trigger::TriggerManager;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading, validating, or activating a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Step graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown step.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// The workflow still has execution history.
    #[error("workflow '{0}' has execution history and cannot be deleted")]
    HasHistory(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters, `-` and `_`
/// - At least one step exists; step and trigger IDs are unique
/// - Step `order` is unique in sequential workflows
/// - Each step kind carries the configuration it needs
/// - Every trigger configuration is well formed
/// - Every step reference resolves and the step graph is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric, '-' and '_' allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    if def.config.workflow_type == WorkflowType::Sequential {
        let mut seen_orders = HashSet::new();
        for step in &def.steps {
            if !seen_orders.insert(step.order) {
                return Err(WorkflowError::ValidationError(format!(
                    "duplicate step order {} (step '{}') in sequential workflow",
                    step.order, step.id
                )));
            }
        }
    }

    for step in &def.steps {
        validate_step(step)?;
    }

    let mut seen_triggers = HashSet::new();
    for trigger in &def.triggers {
        if !seen_triggers.insert(trigger.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate trigger ID: '{}'",
                trigger.id
            )));
        }
        TriggerManager::validate(trigger)
            .map_err(|e| WorkflowError::ValidationError(format!("trigger '{}': {e}", trigger.id)))?;
    }

    if let Some(c) = def.config.concurrency.max_concurrent {
        if c < 1 {
            return Err(WorkflowError::ValidationError(
                "max_concurrent must be >= 1".to_string(),
            ));
        }
    }
    if def.config.timeout_secs == Some(0) || def.config.step_timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(
            "timeout must be > 0".to_string(),
        ));
    }

    validate_dag(def)
}

fn validate_step(step: &StepDefinition) -> Result<(), WorkflowError> {
    let invalid = |msg: &str| {
        Err(WorkflowError::ValidationError(format!(
            "step '{}': {msg}",
            step.id
        )))
    };

    if step.timeout_secs == Some(0) {
        return invalid("timeout must be > 0");
    }

    match &step.config {
        StepConfig::Action { action_type, .. } if action_type.trim().is_empty() => {
            invalid("action_type must not be empty")
        }
        StepConfig::Condition {
            true_step,
            false_step,
            ..
        } if true_step.is_empty() || false_step.is_empty() => {
            invalid("condition steps must define both true_step and false_step")
        }
        StepConfig::Parallel { branches, .. } if branches.is_empty() => {
            invalid("parallel steps must define at least one branch")
        }
        StepConfig::Loop {
            items,
            condition,
            max_iterations,
            body,
        } => {
            if body.is_empty() {
                return invalid("loop body must not be empty");
            }
            if body.iter().any(|b| b == &step.id) {
                return invalid("loop body must not contain the loop itself");
            }
            if items.is_none() && condition.is_none() {
                return invalid("loop needs `items` or `condition`");
            }
            if *max_iterations == Some(0) {
                return invalid("max_iterations must be >= 1");
            }
            Ok(())
        }
        StepConfig::Wait {
            duration_ms, until, ..
        } if duration_ms.is_none() && until.is_none() => {
            invalid("wait steps need `duration_ms` or `until`")
        }
        StepConfig::HumanTask { assignees, .. } if assignees.is_empty() => {
            invalid("human tasks need at least one assignee")
        }
        StepConfig::Notification { recipients, .. } if recipients.is_empty() => {
            invalid("notifications need at least one recipient")
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Replace the steps of a workflow, bumping its version.
///
/// The new definition is validated before the change is applied.
pub fn replace_steps(
    def: &mut WorkflowDefinition,
    steps: Vec<StepDefinition>,
) -> Result<(), WorkflowError> {
    let mut candidate = def.clone();
    candidate.steps = steps;
    validate_definition(&candidate)?;
    def.steps = candidate.steps;
    bump_version(def);
    Ok(())
}

/// Replace the triggers of a workflow, bumping its version.
pub fn replace_triggers(
    def: &mut WorkflowDefinition,
    triggers: Vec<Trigger>,
) -> Result<(), WorkflowError> {
    let mut candidate = def.clone();
    candidate.triggers = triggers;
    validate_definition(&candidate)?;
    def.triggers = candidate.triggers;
    bump_version(def);
    Ok(())
}

fn bump_version(def: &mut WorkflowDefinition) {
    def.version += 1;
    def.updated_at = Utc::now();
    tracing::info!(workflow_id = %def.id, version = def.version, "workflow structure changed");
}

/// Move a workflow to `archived` or `deprecated`.
pub fn set_status(def: &mut WorkflowDefinition, status: WorkflowStatus) {
    def.status = status;
    def.updated_at = Utc::now();
}

/// Refuse hard deletion while the workflow still has history.
pub fn ensure_deletable(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.executions.is_empty() && def.analytics.total_executions == 0 {
        Ok(())
    } else {
        Err(WorkflowError::HasHistory(def.name.clone()))
    }
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML or JSON file (by extension).
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow files (`.yaml`, `.yml`, `.json`) under `base_dir`.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow_file = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_workflow_file {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid workflow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{action, condition_step, parallel_step, workflow};
    use serde_json::json;

    #[test]
    fn test_parse_yaml_roundtrip() {
        let yaml = r#"
name: nightly-digest
steps:
  - id: gather
    order: 1
    config:
      type: action
      action_type: collect
  - id: send
    order: 2
    config:
      type: notification
      recipients: [ops]
      message: "Collected {{ gather.count }} items"
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.name, "nightly-digest");
        assert_eq!(def.steps.len(), 2);

        let yaml_out = serialize_workflow_yaml(&def).unwrap();
        let reparsed = parse_workflow_yaml(&yaml_out).unwrap();
        assert_eq!(reparsed.id, def.id);
        assert_eq!(reparsed.steps[1].id, "send");
    }

    #[test]
    fn test_parse_json() {
        let json = json!({
            "name": "json-flow",
            "steps": [ { "id": "a", "config": { "type": "action", "action_type": "noop" } } ]
        })
        .to_string();
        let def = parse_workflow_json(&json).unwrap();
        assert_eq!(def.steps[0].id, "a");
    }

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let def = workflow(vec![action("a", 1), action("a", 2)]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_validation_rejects_duplicate_order_in_sequential() {
        let def = workflow(vec![action("a", 1), action("b", 1)]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step order"));

        let mut parallel = workflow(vec![action("a", 1), action("b", 1)]);
        parallel.config.workflow_type = WorkflowType::Parallel;
        assert!(validate_definition(&parallel).is_ok());
    }

    #[test]
    fn test_validation_rejects_unknown_next_step() {
        let mut a = action("a", 1);
        a.next_steps = vec![stepwise_types::workflow::NextStep {
            step_id: "ghost".to_string(),
            condition: None,
        }];
        let err = validate_definition(&workflow(vec![a])).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
    }

    #[test]
    fn test_validation_rejects_condition_without_target() {
        let def = workflow(vec![condition_step("check", 1, "", "b"), action("b", 2)]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("true_step and false_step"));
    }

    #[test]
    fn test_validation_rejects_empty_parallel() {
        let p: StepDefinition = serde_json::from_value(json!({
            "id": "fan", "config": { "type": "parallel", "branches": [] }
        }))
        .unwrap();
        let err = validate_definition(&workflow(vec![p])).unwrap_err();
        assert!(err.to_string().contains("at least one branch"));
    }

    #[test]
    fn test_validation_rejects_parallel_with_only_disabled_branches() {
        for wait_for_all in [true, false] {
            let mut a = action("a", 2);
            a.enabled = false;
            let mut b = action("b", 3);
            b.enabled = false;
            let def = workflow(vec![parallel_step("fan", 1, &["a", "b"], wait_for_all), a, b]);
            let err = validate_definition(&def).unwrap_err();
            assert!(err.to_string().contains("no enabled branches"), "{err}");
        }

        let mut a = action("a", 2);
        a.enabled = false;
        let def = workflow(vec![parallel_step("fan", 1, &["a", "b"], false), a, action("b", 3)]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_and_invalid_names() {
        let mut def = workflow(vec![action("a", 1)]);
        def.name = String::new();
        assert!(validate_definition(&def).is_err());
        def.name = "has spaces".to_string();
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout_and_concurrency() {
        let mut def = workflow(vec![action("a", 1)]);
        def.config.timeout_secs = Some(0);
        assert!(validate_definition(&def).is_err());

        let mut def = workflow(vec![action("a", 1)]);
        def.config.concurrency.max_concurrent = Some(0);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_trigger() {
        let mut def = workflow(vec![action("a", 1)]);
        def.triggers = vec![serde_json::from_value(json!({
            "id": "t",
            "config": { "type": "scheduled", "cron": "not a cron" }
        }))
        .unwrap()];
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("trigger 't'"), "got: {err}");
    }

    #[test]
    fn test_replace_steps_bumps_version() {
        let mut def = workflow(vec![action("a", 1)]);
        replace_steps(&mut def, vec![action("a", 1), action("b", 2)]).unwrap();
        assert_eq!(def.version, 2);
        assert_eq!(def.steps.len(), 2);

        // Invalid replacement leaves the definition untouched.
        let err = replace_steps(&mut def, vec![]);
        assert!(err.is_err());
        assert_eq!(def.version, 2);
        assert_eq!(def.steps.len(), 2);
    }

    #[test]
    fn test_workflow_with_history_is_not_deletable() {
        let mut def = workflow(vec![action("a", 1)]);
        assert!(ensure_deletable(&def).is_ok());
        def.analytics.total_executions = 1;
        assert!(matches!(
            ensure_deletable(&def),
            Err(WorkflowError::HasHistory(_))
        ));
        set_status(&mut def, WorkflowStatus::Archived);
        assert_eq!(def.status, WorkflowStatus::Archived);
    }

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows/test.yaml");

        let def = workflow(vec![action("a", 1)]);
        save_workflow_file(&path, &def).unwrap();

        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded.name, def.name);
        assert_eq!(loaded.steps.len(), 1);
    }

    #[test]
    fn test_discover_workflows() {
        let dir = tempfile::tempdir().unwrap();

        let mut wf1 = workflow(vec![action("a", 1)]);
        wf1.name = "wf-one".to_string();
        let mut wf2 = workflow(vec![action("b", 1)]);
        wf2.name = "wf-two".to_string();

        save_workflow_file(&dir.path().join("wf1.yaml"), &wf1).unwrap();
        save_workflow_file(&dir.path().join("sub/wf2.yml"), &wf2).unwrap();
        std::fs::write(dir.path().join("not-a-workflow.yaml"), "key: value").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let result = discover_workflows(Path::new("/nonexistent/path")).unwrap();
        assert!(result.is_empty());
    }
}
