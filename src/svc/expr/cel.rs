//! # CEL module
//!
//! This module wraps the cel-interpreter engine, bridging the evaluation
//! context into CEL variables and mapping absent references back onto the
//! null-safe semantics of the context

use std::{collections::HashMap, sync::Arc};

use cel_interpreter::{objects::Key, Context, ExecutionError, Program, Value as CelValue};
use serde_json::{Map, Value};

use crate::svc::context::EvaluationContext;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse expression '{0}', {1}")]
    Parse(String, String),
    #[error("failed to evaluate expression '{0}', {1}")]
    Evaluate(String, String),
}

// -----------------------------------------------------------------------------
// Helper functions

/// evaluates the expression against the context and returns the produced
/// json value. A reference to a missing variable or key resolves to `None`
/// instead of an error, matching the null-safe navigation of the context.
pub fn evaluate(expression: &str, ctx: &EvaluationContext) -> Result<Option<Value>, Error> {
    let program = Program::compile(expression)
        .map_err(|err| Error::Parse(expression.to_owned(), err.to_string()))?;

    let mut context = Context::default();
    for (key, value) in ctx.values() {
        context.add_variable_from_value(key.to_owned(), to_cel(value));
    }

    match program.execute(&context) {
        Ok(value) => Ok(Some(from_cel(&value))),
        Err(ExecutionError::NoSuchKey(_)) | Err(ExecutionError::UndeclaredReference(_)) => Ok(None),
        Err(err) => Err(Error::Evaluate(expression.to_owned(), err.to_string())),
    }
}

/// evaluates the expression as a boolean gate. Absent references gate to
/// false, a non-boolean result is an error.
pub fn evaluate_bool(expression: &str, ctx: &EvaluationContext) -> Result<bool, Error> {
    match evaluate(expression, ctx)? {
        None => Ok(false),
        Some(Value::Bool(matched)) => Ok(matched),
        Some(value) => Err(Error::Evaluate(
            expression.to_owned(),
            format!("expected a boolean result, got '{value}'"),
        )),
    }
}

// -----------------------------------------------------------------------------
// Value conversion

/// converts a json tree into the engine's value space
pub fn to_cel(value: &Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(b) => CelValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                CelValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => CelValue::String(Arc::new(s.to_owned())),
        Value::Array(items) => CelValue::List(Arc::new(items.iter().map(to_cel).collect())),
        Value::Object(map) => {
            let mut entries = HashMap::with_capacity(map.len());

            for (key, value) in map {
                entries.insert(Key::String(Arc::new(key.to_owned())), to_cel(value));
            }

            CelValue::Map(entries.into())
        }
    }
}

/// converts an engine value back into a json tree
pub fn from_cel(value: &CelValue) -> Value {
    match value {
        CelValue::Null => Value::Null,
        CelValue::Bool(b) => Value::from(*b),
        CelValue::Int(i) => Value::from(*i),
        CelValue::UInt(u) => Value::from(*u),
        CelValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CelValue::String(s) => Value::from(s.as_str()),
        CelValue::Bytes(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
        CelValue::List(items) => Value::Array(items.iter().map(from_cel).collect()),
        CelValue::Map(map) => {
            let mut entries = Map::new();

            for (key, value) in map.map.as_ref() {
                entries.insert(key_to_string(key), from_cel(value));
            }

            Value::Object(entries)
        }
        CelValue::Duration(duration) => Value::from(duration.to_string()),
        CelValue::Timestamp(timestamp) => Value::from(timestamp.to_rfc3339()),
        _ => Value::Null,
    }
}

fn key_to_string(key: &Key) -> String {
    match key {
        Key::String(s) => s.as_str().to_owned(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{evaluate, evaluate_bool, Error};
    use crate::svc::context::EvaluationContext;

    fn context() -> EvaluationContext {
        let mut ctx = EvaluationContext::new();

        ctx.set(
            "status",
            json!({
                "conditions": [
                    {"type": "Ready", "status": "True"},
                    {"type": "Degraded", "status": "False"},
                ],
            }),
        );
        ctx.set("spec", json!({"region": "us-east-1", "replicas": 3}));
        ctx
    }

    #[test]
    fn filter_and_index_extract_the_ready_condition() {
        let value = evaluate(
            "status.conditions.filter(c, c.type == \"Ready\")[0].status",
            &context(),
        )
        .unwrap();

        assert_eq!(value, Some(Value::from("True")));
    }

    #[test]
    fn logical_and_arithmetic_operators_compose() {
        assert!(evaluate_bool(
            "spec.replicas * 2 >= 6 && spec.region == \"us-east-1\"",
            &context()
        )
        .unwrap());

        assert!(!evaluate_bool("spec.replicas < 3 || size(status.conditions) == 0", &context()).unwrap());
    }

    #[test]
    fn ternary_and_size_are_supported() {
        let value = evaluate(
            "size(status.conditions) > 1 ? \"many\" : \"few\"",
            &context(),
        )
        .unwrap();

        assert_eq!(value, Some(Value::from("many")));
    }

    #[test]
    fn absent_references_resolve_to_none() {
        assert_eq!(evaluate("status.missing.deeper", &context()).unwrap(), None);
        assert_eq!(evaluate("nothing.at.all", &context()).unwrap(), None);
        assert!(!evaluate_bool("status.missing == \"x\"", &context()).unwrap());
    }

    #[test]
    fn null_comparison_is_supported() {
        assert!(evaluate_bool("spec.region != null", &context()).unwrap());
    }

    #[test]
    fn has_reports_field_presence() {
        assert!(evaluate_bool("has(spec.region)", &context()).unwrap());
        assert!(!evaluate_bool("has(spec.missing)", &context()).unwrap());
    }

    #[test]
    fn parse_error_names_the_expression() {
        let err = evaluate("spec.region ==", &context()).unwrap_err();

        assert!(matches!(err, Error::Parse(expr, _) if expr == "spec.region =="));
    }

    #[test]
    fn non_boolean_gate_is_an_error() {
        let err = evaluate_bool("spec.region", &context()).unwrap_err();

        assert!(matches!(err, Error::Evaluate(..)));
    }
}
