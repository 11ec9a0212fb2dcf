//! # Expression module
//!
//! This module provides the condition evaluator used by preconditions. The
//! same semantics are exposed through two surfaces, the operator form and
//! the CEL form, plus a conversion from the former to the latter

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::svc::context::{self, EvaluationContext};

pub mod cel;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to evaluate condition on field '{field}', operator '{operator}' expects {expected}")]
    Type {
        field: String,
        operator: Operator,
        expected: &'static str,
    },
    #[error("failed to evaluate expression, {0}")]
    Cel(cel::Error),
}

impl From<cel::Error> for Error {
    fn from(err: cel::Error) -> Self {
        Self::Cel(err)
    }
}

// -----------------------------------------------------------------------------
// Operator enumeration

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Equals => write!(f, "equals"),
            Self::NotEquals => write!(f, "notEquals"),
            Self::In => write!(f, "in"),
            Self::NotIn => write!(f, "notIn"),
            Self::Contains => write!(f, "contains"),
            Self::GreaterThan => write!(f, "greaterThan"),
            Self::LessThan => write!(f, "lessThan"),
            Self::Exists => write!(f, "exists"),
        }
    }
}

// -----------------------------------------------------------------------------
// Condition structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Condition {
    #[serde(rename = "field")]
    pub field: String,
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "value", default)]
    pub value: Value,
}

// -----------------------------------------------------------------------------
// Evaluation structure

/// outcome of a condition list or expression evaluation
#[derive(Serialize, Clone, Debug)]
pub struct Evaluation {
    #[serde(rename = "matched")]
    pub matched: bool,
    /// index of the first condition that did not match, -1 when all matched
    #[serde(rename = "failedConditionIndex")]
    pub failed_condition_index: i64,
    #[serde(rename = "fieldValue")]
    pub field_value: Option<Value>,
    #[serde(rename = "extractedFields")]
    pub extracted_fields: Map<String, Value>,
}

impl Evaluation {
    fn matched(extracted_fields: Map<String, Value>, field_value: Option<Value>) -> Self {
        Self {
            matched: true,
            failed_condition_index: -1,
            field_value,
            extracted_fields,
        }
    }

    fn unmatched(
        index: i64,
        extracted_fields: Map<String, Value>,
        field_value: Option<Value>,
    ) -> Self {
        Self {
            matched: false,
            failed_condition_index: index,
            field_value,
            extracted_fields,
        }
    }
}

// -----------------------------------------------------------------------------
// Operator form evaluation

/// evaluates the conditions in order against the context, stopping at the
/// first one that does not match
pub fn evaluate_conditions(
    conditions: &[Condition],
    ctx: &EvaluationContext,
) -> Result<Evaluation, Error> {
    let mut extracted = Map::new();
    let mut last = None;

    for (index, condition) in conditions.iter().enumerate() {
        let field_value = ctx.get_nested(&condition.field).cloned();

        if let Some(value) = &field_value {
            extracted.insert(condition.field.to_owned(), value.to_owned());
        }

        let matched = evaluate_condition(condition, field_value.as_ref())?;

        if !matched {
            return Ok(Evaluation::unmatched(index as i64, extracted, field_value));
        }

        last = field_value;
    }

    Ok(Evaluation::matched(extracted, last))
}

/// evaluates a single condition against the resolved field value, `None`
/// standing for an absent field
pub fn evaluate_condition(condition: &Condition, field: Option<&Value>) -> Result<bool, Error> {
    match condition.operator {
        Operator::Equals => Ok(matches!(field, Some(value) if values_equal(value, &condition.value))),
        Operator::NotEquals => {
            Ok(!matches!(field, Some(value) if values_equal(value, &condition.value)))
        }
        Operator::In => {
            let list = condition.value.as_array().ok_or(Error::Type {
                field: condition.field.to_owned(),
                operator: condition.operator,
                expected: "a list of literals",
            })?;

            Ok(matches!(field, Some(value) if list.iter().any(|item| values_equal(value, item))))
        }
        Operator::NotIn => {
            let list = condition.value.as_array().ok_or(Error::Type {
                field: condition.field.to_owned(),
                operator: condition.operator,
                expected: "a list of literals",
            })?;

            Ok(!matches!(field, Some(value) if list.iter().any(|item| values_equal(value, item))))
        }
        Operator::Contains => match field {
            None => Ok(false),
            Some(Value::String(haystack)) => {
                let needle = condition.value.as_str().ok_or(Error::Type {
                    field: condition.field.to_owned(),
                    operator: condition.operator,
                    expected: "a string value for a string field",
                })?;

                Ok(haystack.contains(needle))
            }
            Some(Value::Array(items)) => {
                Ok(items.iter().any(|item| values_equal(item, &condition.value)))
            }
            Some(_) => Err(Error::Type {
                field: condition.field.to_owned(),
                operator: condition.operator,
                expected: "a string or a list field",
            }),
        },
        Operator::GreaterThan => match field {
            None => Ok(false),
            Some(value) => {
                let left = as_number(value).ok_or(Error::Type {
                    field: condition.field.to_owned(),
                    operator: condition.operator,
                    expected: "a numeric field",
                })?;

                let right = as_number(&condition.value).ok_or(Error::Type {
                    field: condition.field.to_owned(),
                    operator: condition.operator,
                    expected: "a numeric value",
                })?;

                Ok(left > right)
            }
        },
        Operator::LessThan => match field {
            None => Ok(false),
            Some(value) => {
                let left = as_number(value).ok_or(Error::Type {
                    field: condition.field.to_owned(),
                    operator: condition.operator,
                    expected: "a numeric field",
                })?;

                let right = as_number(&condition.value).ok_or(Error::Type {
                    field: condition.field.to_owned(),
                    operator: condition.operator,
                    expected: "a numeric value",
                })?;

                Ok(left < right)
            }
        },
        Operator::Exists => Ok(matches!(field, Some(value) if context::is_non_empty(value))),
    }
}

/// deep equality with numeric widening, an integer compares equal to the
/// float it widens to
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l.iter().all(|(key, left)| {
                    r.get(key).map(|right| values_equal(left, right)).unwrap_or(false)
                })
        }
        (l, r) => l == r,
    }
}

/// reads the value as a number, coercing strings that parse as one
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// CEL form evaluation

/// evaluates a CEL expression as a precondition gate, returning the same
/// shape as the operator form
pub fn evaluate_expression(
    expression: &str,
    ctx: &EvaluationContext,
) -> Result<Evaluation, Error> {
    let value = cel::evaluate(expression, ctx)?;

    let matched = match &value {
        None => false,
        Some(Value::Bool(matched)) => *matched,
        Some(value) => {
            return Err(Error::Cel(cel::Error::Evaluate(
                expression.to_owned(),
                format!("expected a boolean result, got '{value}'"),
            )))
        }
    };

    Ok(Evaluation {
        matched,
        failed_condition_index: if matched { -1 } else { 0 },
        field_value: value,
        extracted_fields: Map::new(),
    })
}

// -----------------------------------------------------------------------------
// Operator to CEL conversion

/// converts a list of operator conditions into a single CEL expression with
/// the same match semantics, joined by '&&'
pub fn to_cel_expression(conditions: &[Condition]) -> String {
    conditions
        .iter()
        .map(condition_to_cel)
        .collect::<Vec<_>>()
        .join(" && ")
}

fn condition_to_cel(condition: &Condition) -> String {
    let field = cel_path(&condition.field);
    let literal = condition.value.to_string();

    match condition.operator {
        Operator::Equals => format!("{field} == {literal}"),
        // an absent field matches the negative operators, the presence
        // guard short-circuits before the member access can error
        Operator::NotEquals => format!("(!has({field}) || {field} != {literal})"),
        Operator::In => format!("{field} in {literal}"),
        Operator::NotIn => format!("(!has({field}) || !({field} in {literal}))"),
        Operator::Contains => format!("{field}.contains({literal})"),
        Operator::GreaterThan => format!("{field} > {literal}"),
        Operator::LessThan => format!("{field} < {literal}"),
        Operator::Exists => format!("size({field}) > 0"),
    }
}

/// turns a dotted context path into a CEL member expression, numeric
/// segments become list indexing
fn cel_path(path: &str) -> String {
    let mut output = String::with_capacity(path.len());

    for segment in path.split('.') {
        if segment.chars().all(|c| c.is_ascii_digit()) && !segment.is_empty() {
            output.push('[');
            output.push_str(segment);
            output.push(']');
        } else {
            if !output.is_empty() {
                output.push('.');
            }
            output.push_str(segment);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{
        evaluate_condition, evaluate_conditions, evaluate_expression, to_cel_expression, Condition,
        Error, Evaluation, Operator,
    };
    use crate::svc::context::EvaluationContext;

    fn condition(field: &str, operator: Operator, value: Value) -> Condition {
        Condition {
            field: field.to_owned(),
            operator,
            value,
        }
    }

    fn context() -> EvaluationContext {
        let mut ctx = EvaluationContext::new();

        ctx.set(
            "cluster",
            json!({
                "id": "c1",
                "region": "us-east-1",
                "replicas": 3,
                "size": "2.0",
                "labels": ["prod", "managed"],
                "empty": "",
            }),
        );

        ctx
    }

    #[test]
    fn equals_widens_numerics() {
        let ctx = context();

        let eval =
            evaluate_conditions(&[condition("cluster.replicas", Operator::Equals, json!(3.0))], &ctx)
                .unwrap();

        assert!(eval.matched);
        assert_eq!(eval.failed_condition_index, -1);
        assert_eq!(eval.field_value, Some(json!(3)));
    }

    #[test]
    fn equals_against_absent_never_matches() {
        let ctx = context();

        assert!(!evaluate_condition(
            &condition("cluster.missing", Operator::Equals, json!("x")),
            ctx.get_nested("cluster.missing")
        )
        .unwrap());

        assert!(evaluate_condition(
            &condition("cluster.missing", Operator::NotEquals, json!("x")),
            ctx.get_nested("cluster.missing")
        )
        .unwrap());
    }

    #[test]
    fn membership_is_element_wise_equality() {
        let ctx = context();

        let eval = evaluate_conditions(
            &[condition(
                "cluster.region",
                Operator::In,
                json!(["us-east-1", "eu-west-1"]),
            )],
            &ctx,
        )
        .unwrap();
        assert!(eval.matched);

        let eval = evaluate_conditions(
            &[condition("cluster.region", Operator::NotIn, json!(["eu-west-1"]))],
            &ctx,
        )
        .unwrap();
        assert!(eval.matched);
    }

    #[test]
    fn contains_covers_strings_and_lists() {
        let ctx = context();

        assert!(evaluate_condition(
            &condition("cluster.region", Operator::Contains, json!("east")),
            ctx.get_nested("cluster.region")
        )
        .unwrap());

        assert!(evaluate_condition(
            &condition("cluster.labels", Operator::Contains, json!("prod")),
            ctx.get_nested("cluster.labels")
        )
        .unwrap());

        assert!(!evaluate_condition(
            &condition("cluster.region", Operator::Contains, json!("EAST")),
            ctx.get_nested("cluster.region")
        )
        .unwrap());
    }

    #[test]
    fn ordering_coerces_numeric_strings() {
        let ctx = context();

        assert!(evaluate_condition(
            &condition("cluster.size", Operator::GreaterThan, json!(1)),
            ctx.get_nested("cluster.size")
        )
        .unwrap());

        assert!(evaluate_condition(
            &condition("cluster.replicas", Operator::LessThan, json!("10")),
            ctx.get_nested("cluster.replicas")
        )
        .unwrap());
    }

    #[test]
    fn ordering_on_non_numeric_is_a_type_error() {
        let ctx = context();

        let err = evaluate_condition(
            &condition("cluster.region", Operator::GreaterThan, json!(1)),
            ctx.get_nested("cluster.region"),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Type { field, operator: Operator::GreaterThan, .. } if field == "cluster.region"
        ));
    }

    #[test]
    fn exists_requires_a_non_empty_value() {
        let ctx = context();

        assert!(evaluate_condition(
            &condition("cluster.labels", Operator::Exists, Value::Null),
            ctx.get_nested("cluster.labels")
        )
        .unwrap());

        assert!(!evaluate_condition(
            &condition("cluster.empty", Operator::Exists, Value::Null),
            ctx.get_nested("cluster.empty")
        )
        .unwrap());

        assert!(!evaluate_condition(
            &condition("cluster.missing", Operator::Exists, Value::Null),
            ctx.get_nested("cluster.missing")
        )
        .unwrap());
    }

    #[test]
    fn first_failed_condition_index_is_reported() {
        let ctx = context();

        let eval = evaluate_conditions(
            &[
                condition("cluster.id", Operator::Equals, json!("c1")),
                condition("cluster.region", Operator::Equals, json!("eu-west-1")),
                condition("cluster.replicas", Operator::Equals, json!(3)),
            ],
            &ctx,
        )
        .unwrap();

        assert!(!eval.matched);
        assert_eq!(eval.failed_condition_index, 1);
        assert_eq!(
            eval.extracted_fields.get("cluster.id"),
            Some(&json!("c1"))
        );
    }

    #[test]
    fn conversion_produces_the_documented_mapping() {
        let expression = to_cel_expression(&[
            condition("cluster.region", Operator::Equals, json!("us-east-1")),
            condition("cluster.labels", Operator::Contains, json!("prod")),
            condition("status.conditions.0.status", Operator::NotIn, json!(["False"])),
        ]);

        assert_eq!(
            expression,
            "cluster.region == \"us-east-1\" && cluster.labels.contains(\"prod\") \
             && (!has(status.conditions[0].status) \
             || !(status.conditions[0].status in [\"False\"]))"
        );
    }

    #[test]
    fn operator_and_cel_forms_agree() {
        let ctx = context();

        let cases = vec![
            vec![condition("cluster.region", Operator::Equals, json!("us-east-1"))],
            vec![condition("cluster.missing", Operator::Equals, json!("x"))],
            vec![condition("cluster.region", Operator::NotEquals, json!("eu-west-1"))],
            // absent fields match the negative operators in both forms
            vec![condition("cluster.missing", Operator::NotEquals, json!("x"))],
            vec![condition("cluster.labels", Operator::Contains, json!("prod"))],
            vec![condition("cluster.replicas", Operator::GreaterThan, json!(1))],
            vec![condition("cluster.replicas", Operator::LessThan, json!(1))],
            vec![condition("cluster.labels", Operator::Exists, Value::Null)],
            vec![condition("cluster.missing", Operator::Exists, Value::Null)],
            vec![
                condition("cluster.id", Operator::In, json!(["c1", "c2"])),
                condition("cluster.region", Operator::Contains, json!("east")),
            ],
            vec![condition("cluster.region", Operator::NotIn, json!(["eu-west-1"]))],
            vec![condition("cluster.missing", Operator::NotIn, json!(["x"]))],
        ];

        for conditions in cases {
            let operator_form = evaluate_conditions(&conditions, &ctx).unwrap();
            let cel_form = evaluate_expression(&to_cel_expression(&conditions), &ctx).unwrap();

            assert_eq!(
                operator_form.matched,
                cel_form.matched,
                "forms disagree on {}",
                to_cel_expression(&conditions)
            );
        }
    }

    #[test]
    fn expression_gate_reports_the_match() {
        let ctx = context();

        let eval: Evaluation =
            evaluate_expression("cluster.replicas > 1 && cluster.id == \"c1\"", &ctx).unwrap();

        assert!(eval.matched);
        assert_eq!(eval.extracted_fields, Map::new());

        let eval = evaluate_expression("cluster.replicas > 5", &ctx).unwrap();
        assert!(!eval.matched);
        assert_eq!(eval.failed_condition_index, 0);
    }
}
