//! Execution context with step output tracking and template rendering.
//!
//! `ExecutionContext` is the mutable state that flows through one execution.
//! It stores step outputs (keyed by step ID) alongside the trigger input,
//! plus execution metadata such as environment and priority. Size limits
//! prevent unbounded memory growth.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Keys that `to_expression_context` reserves at the document root.
const RESERVED_KEYS: &[&str] = &[
    "variables",
    "trigger",
    "environment",
    "priority",
    "metadata",
    "workflow",
    "loop",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("context serialization failed: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable variable store threaded through one execution.
///
/// Every step sees the whole context. Only the orchestrator writes step
/// outputs into `variables`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Trigger input fields plus step outputs keyed by step ID.
    pub variables: Map<String, Value>,
    /// Deployment environment label (e.g. "production").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Admission priority; higher runs first under the priority discipline.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Raw input the trigger built.
    #[serde(default)]
    pub trigger_payload: Value,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub execution_id: Uuid,
}

impl ExecutionContext {
    /// Create a context for a new execution.
    ///
    /// When `input` is a JSON object its fields seed `variables`.
    pub fn new(workflow_id: Uuid, workflow_name: &str, execution_id: Uuid, input: Value) -> Self {
        let variables = match &input {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Self {
            variables,
            environment: None,
            priority: 0,
            metadata: Map::new(),
            trigger_payload: input,
            workflow_id,
            workflow_name: workflow_name.to_string(),
            execution_id,
        }
    }

    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Store the output of a completed step.
    ///
    /// Enforces `MAX_STEP_OUTPUT_SIZE` (1 MB) per output by replacing an
    /// oversized output with a truncation marker, and `MAX_CONTEXT_SIZE`
    /// (10 MB) in total.
    pub fn set_step_output(&mut self, step_id: &str, output: Value) -> Result<(), ContextError> {
        let serialized =
            serde_json::to_string(&output).map_err(|e| ContextError::Serialization(e.to_string()))?;

        if serialized.len() > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size = serialized.len(),
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": serialized.len(),
                "_message": format!(
                    "output exceeded {} byte limit and was truncated",
                    MAX_STEP_OUTPUT_SIZE
                )
            });
            self.variables.insert(step_id.to_string(), truncated);
        } else {
            self.variables.insert(step_id.to_string(), output);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            self.variables.remove(step_id);
            return Err(ContextError::TooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }

        Ok(())
    }

    /// Set a scratch variable (loop index/item). Not size-checked.
    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.variables.get(step_id)
    }

    /// Resolve a dot path against `variables`, then against the well-known
    /// roots (`trigger.*`, `metadata.*`, `environment`, `priority`).
    pub fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(v) = lookup_path_in_map(&self.variables, path) {
            return Some(v.clone());
        }
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        match (head, rest) {
            ("variables", Some(rest)) => lookup_path_in_map(&self.variables, rest).cloned(),
            ("trigger", Some(rest)) => lookup_path(&self.trigger_payload, rest).cloned(),
            ("trigger", None) => Some(self.trigger_payload.clone()),
            ("metadata", Some(rest)) => lookup_path_in_map(&self.metadata, rest).cloned(),
            ("environment", None) => self.environment.clone().map(Value::String),
            ("priority", None) => Some(json!(self.priority)),
            _ => None,
        }
    }

    /// Render `{{ name }}` / `{{ a.b.c }}` tokens in a single pass.
    ///
    /// Unresolved tokens are left verbatim. Substituted text is never
    /// re-scanned, so a value containing `{{ ... }}` stays literal.
    pub fn render_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let token = &rest[start..start + 2 + end + 2];
            let key = after_open[..end].trim();
            match self.resolve_token(key) {
                Some(value) => out.push_str(&value_to_string(&value)),
                None => out.push_str(token),
            }
            rest = &after_open[end + 2..];
        }

        out.push_str(rest);
        out
    }

    fn resolve_token(&self, key: &str) -> Option<Value> {
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return None;
        }
        self.lookup(key)
    }

    /// Compute the total serialized size of all context data in bytes.
    pub fn total_size(&self) -> usize {
        let size_of = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        let variables_size: usize = self.variables.values().map(size_of).sum();
        let metadata_size: usize = self.metadata.values().map(size_of).sum();
        variables_size + metadata_size + size_of(&self.trigger_payload)
    }

    /// Serialize the entire context to JSON for the execution record.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Restore a context from a snapshot.
    pub fn restore(value: Value) -> Result<Self, ContextError> {
        serde_json::from_value(value)
            .map_err(|e| ContextError::Serialization(format!("failed to restore context: {e}")))
    }

    /// Build the JSON document conditions and expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "variables": { ... },
    ///   "trigger": <trigger payload>,
    ///   "environment": "...", "priority": 0, "metadata": { ... },
    ///   "workflow": { "id": "...", "name": "...", "execution_id": "..." },
    ///   "<variable>": <value>, ...
    /// }
    /// ```
    /// Variables are also lifted to the root unless they collide with a
    /// reserved key, so `amount > 100` and `variables.amount > 100` agree.
    pub fn to_expression_context(&self) -> Value {
        let mut doc = Map::new();
        for (k, v) in &self.variables {
            if !RESERVED_KEYS.contains(&k.as_str()) {
                doc.insert(k.clone(), v.clone());
            }
        }
        if let Some(loop_vars) = self.variables.get("loop") {
            doc.insert("loop".to_string(), loop_vars.clone());
        }
        doc.insert("variables".to_string(), Value::Object(self.variables.clone()));
        doc.insert("trigger".to_string(), self.trigger_payload.clone());
        doc.insert(
            "environment".to_string(),
            self.environment.clone().map(Value::String).unwrap_or(Value::Null),
        );
        doc.insert("priority".to_string(), json!(self.priority));
        doc.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        doc.insert(
            "workflow".to_string(),
            json!({
                "id": self.workflow_id.to_string(),
                "name": self.workflow_name,
                "execution_id": self.execution_id.to_string(),
            }),
        );
        Value::Object(doc)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve a dot-separated path (`a.b.0.c`) inside a JSON value.
///
/// Numeric segments index into arrays.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_path_in_map<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };
    let first = map.get(head)?;
    match rest {
        Some(rest) => lookup_path(first, rest),
        None => Some(first),
    }
}

/// Convert a JSON value to a display string for template rendering.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
