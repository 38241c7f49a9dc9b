//! Condition evaluation for triggers, condition steps and `next_steps` guards.
//!
//! Two forms are supported, neither of which executes caller code:
//! - structured `Condition` trees of `(field, operator, value)` comparisons
//!   combined with `all` / `any` / `not`;
//! - JEXL expressions, evaluated by `jexl_eval::Evaluator` against a JSON
//!   document with a fixed set of pure transforms.
//!
//! **Security note:** Payloads are always passed as context objects, NEVER
//! interpolated into expression strings.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::{Value, json};
use stepwise_types::workflow::{Condition, ConditionOperator, FieldCondition};

use super::context::{ExecutionContext, lookup_path};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during condition evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{operator}' cannot compare field '{field}' ({actual}) with {expected}")]
    TypeMismatch {
        field: String,
        operator: String,
        actual: String,
        expected: String,
    },

    #[error("invalid field path '{0}'")]
    InvalidPath(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Something conditions can be evaluated against.
pub trait FieldScope {
    /// Resolve a dot-separated field path.
    fn resolve(&self, path: &str) -> Option<Value>;

    /// Full JSON document handed to JEXL.
    fn document(&self) -> Cow<'_, Value>;
}

impl FieldScope for Value {
    fn resolve(&self, path: &str) -> Option<Value> {
        lookup_path(self, path).cloned()
    }

    fn document(&self) -> Cow<'_, Value> {
        Cow::Borrowed(self)
    }
}

impl FieldScope for ExecutionContext {
    fn resolve(&self, path: &str) -> Option<Value> {
        self.lookup(path)
    }

    fn document(&self) -> Cow<'_, Value> {
        Cow::Owned(self.to_expression_context())
    }
}

// ---------------------------------------------------------------------------
// JEXL evaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Built per evaluation: the underlying evaluator holds boxed transforms
/// and is not shared across tasks.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().cloned().unwrap_or(Value::Null);
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match (&subject, &needle) {
                    (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
                    (Value::Array(items), n) => items.iter().any(|i| values_equal(i, n)),
                    (Value::Object(map), Value::String(k)) => map.contains_key(k),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(value_to_bool(&result))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Condition trees
// ---------------------------------------------------------------------------

/// Evaluate a `Condition` tree against a scope.
pub fn evaluate_condition(
    condition: &Condition,
    scope: &dyn FieldScope,
) -> Result<bool, ExpressionError> {
    // The JEXL evaluator is only built when the tree actually needs it.
    let mut jexl: Option<WorkflowEvaluator> = None;
    eval_node(condition, scope, &mut jexl)
}

fn eval_node(
    condition: &Condition,
    scope: &dyn FieldScope,
    jexl: &mut Option<WorkflowEvaluator>,
) -> Result<bool, ExpressionError> {
    match condition {
        Condition::All(children) => {
            for child in children {
                if !eval_node(child, scope, jexl)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Any(children) => {
            for child in children {
                if eval_node(child, scope, jexl)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Not(inner) => Ok(!eval_node(inner, scope, jexl)?),
        Condition::Compare(field) => evaluate_field_condition(field, scope),
        Condition::Expression(expr) => {
            let evaluator = jexl.get_or_insert_with(WorkflowEvaluator::new);
            evaluator.evaluate_bool(expr, &scope.document())
        }
    }
}

/// AND together a list of field conditions. An empty list matches.
pub fn evaluate_all(
    conditions: &[FieldCondition],
    scope: &dyn FieldScope,
) -> Result<bool, ExpressionError> {
    for condition in conditions {
        if !evaluate_field_condition(condition, scope)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluate a single `(field, operator, value)` comparison.
///
/// A missing field never matches, except under `not_equals` and a negated
/// `exists`. Comparing incompatible types is an error rather than `false`.
pub fn evaluate_field_condition(
    condition: &FieldCondition,
    scope: &dyn FieldScope,
) -> Result<bool, ExpressionError> {
    let field = condition.field.trim();
    if field.is_empty() || field.split('.').any(str::is_empty) {
        return Err(ExpressionError::InvalidPath(condition.field.clone()));
    }
    let actual = scope.resolve(field).filter(|v| !v.is_null());
    let expected = &condition.value;

    match &condition.operator {
        ConditionOperator::Exists => {
            let want = !matches!(expected, Value::Bool(false));
            Ok(actual.is_some() == want)
        }
        ConditionOperator::Equals => Ok(actual.is_some_and(|a| values_equal(&a, expected))),
        ConditionOperator::NotEquals => Ok(!actual.is_some_and(|a| values_equal(&a, expected))),
        ConditionOperator::Contains => {
            let Some(actual) = actual else {
                return Ok(false);
            };
            match (&actual, expected) {
                (Value::String(s), Value::String(needle)) => Ok(s.contains(needle.as_str())),
                (Value::Array(items), needle) => Ok(items.iter().any(|i| values_equal(i, needle))),
                (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
                _ => Err(mismatch(condition, &actual)),
            }
        }
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
            let Some(actual) = actual else {
                return Ok(false);
            };
            let ordering = compare_values(&actual, expected).ok_or_else(|| mismatch(condition, &actual))?;
            Ok(match condition.operator {
                ConditionOperator::GreaterThan => ordering == Ordering::Greater,
                _ => ordering == Ordering::Less,
            })
        }
        ConditionOperator::Unknown(op) => Err(ExpressionError::UnknownOperator(op.clone())),
    }
}

fn mismatch(condition: &FieldCondition, actual: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch {
        field: condition.field.clone(),
        operator: operator_name(&condition.operator),
        actual: type_name(actual).to_string(),
        expected: type_name(&condition.value).to_string(),
    }
}

fn operator_name(op: &ConditionOperator) -> String {
    match op {
        ConditionOperator::Equals => "equals".to_string(),
        ConditionOperator::NotEquals => "not_equals".to_string(),
        ConditionOperator::Contains => "contains".to_string(),
        ConditionOperator::GreaterThan => "greater_than".to_string(),
        ConditionOperator::LessThan => "less_than".to_string(),
        ConditionOperator::Exists => "exists".to_string(),
        ConditionOperator::Unknown(op) => op.clone(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Equality with numeric normalisation (`1 == 1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two numbers or two strings; `None` otherwise.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn compare(field: &str, operator: ConditionOperator, value: Value) -> FieldCondition {
        FieldCondition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn payload() -> Value {
        json!({
            "amount": 1500,
            "currency": "EUR",
            "tags": ["urgent", "vip"],
            "customer": { "name": "Acme", "tier": "gold" },
            "note": null
        })
    }

    #[test]
    fn test_equals_and_not_equals() {
        let p = payload();
        assert!(evaluate_field_condition(&compare("currency", ConditionOperator::Equals, json!("EUR")), &p).unwrap());
        assert!(evaluate_field_condition(&compare("amount", ConditionOperator::Equals, json!(1500.0)), &p).unwrap());
        assert!(evaluate_field_condition(&compare("currency", ConditionOperator::NotEquals, json!("USD")), &p).unwrap());
        assert!(evaluate_field_condition(&compare("missing", ConditionOperator::NotEquals, json!("x")), &p).unwrap());
        assert!(!evaluate_field_condition(&compare("missing", ConditionOperator::Equals, json!("x")), &p).unwrap());
    }

    #[test]
    fn test_contains_variants() {
        let p = payload();
        assert!(evaluate_field_condition(&compare("tags", ConditionOperator::Contains, json!("vip")), &p).unwrap());
        assert!(evaluate_field_condition(&compare("customer.name", ConditionOperator::Contains, json!("cm")), &p).unwrap());
        assert!(evaluate_field_condition(&compare("customer", ConditionOperator::Contains, json!("tier")), &p).unwrap());
        let err = evaluate_field_condition(&compare("amount", ConditionOperator::Contains, json!("1")), &p);
        assert!(matches!(err, Err(ExpressionError::TypeMismatch { .. })));
    }

    #[test]
    fn test_ordering_operators() {
        let p = payload();
        assert!(evaluate_field_condition(&compare("amount", ConditionOperator::GreaterThan, json!(1000)), &p).unwrap());
        assert!(!evaluate_field_condition(&compare("amount", ConditionOperator::LessThan, json!(1000)), &p).unwrap());
        assert!(evaluate_field_condition(&compare("currency", ConditionOperator::LessThan, json!("USD")), &p).unwrap());
        assert!(!evaluate_field_condition(&compare("missing", ConditionOperator::GreaterThan, json!(1)), &p).unwrap());
        let err = evaluate_field_condition(&compare("currency", ConditionOperator::GreaterThan, json!(5)), &p);
        assert!(matches!(err, Err(ExpressionError::TypeMismatch { .. })));
    }

    #[test]
    fn test_exists_treats_null_as_absent() {
        let p = payload();
        assert!(evaluate_field_condition(&compare("customer.tier", ConditionOperator::Exists, Value::Null), &p).unwrap());
        assert!(!evaluate_field_condition(&compare("note", ConditionOperator::Exists, Value::Null), &p).unwrap());
        assert!(evaluate_field_condition(&compare("note", ConditionOperator::Exists, json!(false)), &p).unwrap());
    }

    #[test]
    fn test_unknown_operator_and_bad_path_error() {
        let p = payload();
        let err = evaluate_field_condition(
            &compare("amount", ConditionOperator::Unknown("matches_regex".into()), json!(".*")),
            &p,
        );
        assert!(matches!(err, Err(ExpressionError::UnknownOperator(op)) if op == "matches_regex"));
        let err = evaluate_field_condition(&compare("a..b", ConditionOperator::Exists, Value::Null), &p);
        assert!(matches!(err, Err(ExpressionError::InvalidPath(_))));
    }

    #[test]
    fn test_only_six_operator_names_are_known() {
        for name in ["equals", "not_equals", "contains", "greater_than", "less_than", "exists"] {
            let op: ConditionOperator = serde_json::from_value(json!(name)).unwrap();
            assert!(!matches!(op, ConditionOperator::Unknown(_)), "{name}");
        }
        for name in ["in", "changed", "matches"] {
            let op: ConditionOperator = serde_json::from_value(json!(name)).unwrap();
            assert_eq!(op, ConditionOperator::Unknown(name.to_string()));
            let err = evaluate_field_condition(&compare("amount", op, json!(1)), &payload());
            assert!(matches!(err, Err(ExpressionError::UnknownOperator(_))));
        }
    }

    #[test]
    fn test_evaluate_all_ands_conditions() {
        let p = payload();
        let conds = vec![
            compare("amount", ConditionOperator::GreaterThan, json!(1000)),
            compare("currency", ConditionOperator::Equals, json!("EUR")),
        ];
        assert!(evaluate_all(&conds, &p).unwrap());
        let conds = vec![
            compare("amount", ConditionOperator::GreaterThan, json!(1000)),
            compare("currency", ConditionOperator::Equals, json!("USD")),
        ];
        assert!(!evaluate_all(&conds, &p).unwrap());
        assert!(evaluate_all(&[], &p).unwrap());
    }

    #[test]
    fn test_condition_tree() {
        let p = payload();
        let cond = Condition::All(vec![
            Condition::Compare(compare("amount", ConditionOperator::GreaterThan, json!(1000))),
            Condition::Not(Box::new(Condition::Compare(compare(
                "customer.tier",
                ConditionOperator::Equals,
                json!("bronze"),
            )))),
            Condition::Any(vec![
                Condition::Expression("currency == 'USD'".to_string()),
                Condition::Expression("tags|length > 1".to_string()),
            ]),
        ]);
        assert!(evaluate_condition(&cond, &p).unwrap());
    }

    #[test]
    fn test_jexl_expression_against_context() {
        let mut ctx = ExecutionContext::new(Uuid::now_v7(), "wf", Uuid::now_v7(), json!({ "amount": 250 }));
        ctx.set_step_output("score", json!({ "value": 0.9 })).unwrap();

        let cond = Condition::Expression("variables.amount > 100 && score.value >= 0.5".to_string());
        assert!(evaluate_condition(&cond, &ctx).unwrap());
        let cond = Condition::Expression("workflow.name|upper == 'WF'".to_string());
        assert!(evaluate_condition(&cond, &ctx).unwrap());
    }

    #[test]
    fn test_jexl_syntax_error_is_reported() {
        let cond = Condition::Expression("amount >>> ".to_string());
        let err = evaluate_condition(&cond, &payload());
        assert!(matches!(err, Err(ExpressionError::EvalFailed(_))));
    }

    #[test]
    fn test_non_object_context_rejected() {
        let evaluator = WorkflowEvaluator::new();
        let err = evaluator.evaluate_bool("true", &json!([1]));
        assert!(matches!(err, Err(ExpressionError::InvalidContext(_))));
    }

    #[test]
    fn test_value_to_bool_truthiness() {
        assert!(!value_to_bool(&Value::Null));
        assert!(!value_to_bool(&json!(0)));
        assert!(!value_to_bool(&json!("")));
        assert!(value_to_bool(&json!("x")));
        assert!(value_to_bool(&json!([])));
    }
}
