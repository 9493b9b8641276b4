//! JEXL expression evaluator for edge conditions and trigger `when` clauses.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//!
//! **Security note:** Payloads are always passed as context objects, NEVER
//! interpolated into expression strings.
//!
//! The evaluator holds boxed transform closures and is not `Send`, so callers
//! build one where they need it and never hold it across an `.await`.

use serde_json::{Value, json};

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// Boolean condition evaluation, injected into the decider.
pub trait ConditionEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError>;
}

/// JEXL expression evaluator with standard transforms pre-registered.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

fn str_arg(args: &[Value], i: usize) -> &str {
    args.get(i).and_then(|v| v.as_str()).unwrap_or("")
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    ///
    /// The `context` must be a JSON object.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|v| value_to_bool(&v))
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

impl ConditionEvaluator for WorkflowEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, context)
    }
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate an optional `when` filter; an absent filter always matches.
pub fn matches_when(when: Option<&str>, context: &Value) -> Result<bool, ExpressionError> {
    match when {
        None => Ok(true),
        Some(expr) if expr.trim().is_empty() => Ok(true),
        Some(expr) => WorkflowEvaluator::new().evaluate_bool(expr, context),
    }
}
