//! # Params module
//!
//! This module populates the evaluation context from the environment, the
//! event and declared defaults, per the parameter schema

use serde_json::{Map, Value};
use tracing::debug;

use crate::svc::{
    adapter::{Param, PARAM_SOURCE_ENV, PARAM_SOURCE_EVENT},
    context::{navigate, EvaluationContext},
    event::Event,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to resolve parameter '{0}', it is required and no source yielded a value")]
    Missing(String),
    #[error("failed to resolve parameter '{0}', the event body is not a json object")]
    MalformedEvent(String),
}

// -----------------------------------------------------------------------------
// Helper functions

/// resolves the parameters in declaration order into the context. A dotted
/// parameter name is stored as a nested path.
pub fn resolve(
    params: &[Param],
    event: &Event,
    ctx: &mut EvaluationContext,
) -> Result<(), Error> {
    let root = event_root(event);

    for param in params {
        let mut value = match &param.source {
            Some(source) if source.starts_with(PARAM_SOURCE_ENV) => {
                let variable = &source[PARAM_SOURCE_ENV.len()..];

                std::env::var(variable).ok().map(Value::from)
            }
            Some(source) if source.starts_with(PARAM_SOURCE_EVENT) => {
                let path = &source[PARAM_SOURCE_EVENT.len()..];

                if !event.data.is_null() && event.body().is_none() {
                    return Err(Error::MalformedEvent(param.name.to_owned()));
                }

                lookup(&root, path).cloned()
            }
            _ => None,
        };

        if !matches!(value, Some(ref value) if !value.is_null()) {
            value = param.default.to_owned();
        }

        match value {
            Some(value) if !value.is_null() => {
                debug!(param = &param.name, "Resolved parameter");

                if param.name.contains('.') {
                    ctx.set_nested(&param.name, value);
                } else {
                    ctx.set(&param.name, value);
                }
            }
            _ if param.required => return Err(Error::Missing(param.name.to_owned())),
            _ => {}
        }
    }

    Ok(())
}

/// event view addressed by `event.<path>` sources, the json body extended
/// with the context attributes of the envelope when the body does not
/// shadow them
fn event_root(event: &Event) -> Value {
    let mut root = event.body().cloned().unwrap_or_else(Map::new);

    for (key, value) in [
        ("id", Value::from(event.id.to_owned())),
        ("type", Value::from(event.kind.to_owned())),
        ("source", Value::from(event.source.to_owned())),
        (
            "time",
            event
                .time
                .map(|time| Value::from(time.to_rfc3339()))
                .unwrap_or(Value::Null),
        ),
    ] {
        root.entry(key.to_owned()).or_insert(value);
    }

    Value::Object(root)
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = root;

    for segment in path.split('.') {
        cursor = navigate(cursor, segment)?;
    }

    Some(cursor)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{resolve, Error};
    use crate::svc::{adapter::Param, context::EvaluationContext, event::Event};

    fn param(name: &str, source: Option<&str>, default: Option<Value>, required: bool) -> Param {
        Param {
            name: name.to_owned(),
            source: source.map(str::to_owned),
            default,
            required,
        }
    }

    fn event(data: Value) -> Event {
        Event {
            spec_version: "1.0".to_owned(),
            id: "evt-1".to_owned(),
            kind: "io.cluster.provisioned".to_owned(),
            source: "/clusters".to_owned(),
            time: None,
            data_content_type: None,
            data,
        }
    }

    #[test]
    fn event_sources_resolve_nested_paths() {
        let mut ctx = EvaluationContext::new();

        resolve(
            &[
                param("cluster_id", Some("event.cluster_id"), None, true),
                param("region", Some("event.spec.region"), None, false),
            ],
            &event(json!({"cluster_id": "c1", "spec": {"region": "us-east-1"}})),
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.get("cluster_id"), Some(&json!("c1")));
        assert_eq!(ctx.get("region"), Some(&json!("us-east-1")));
    }

    #[test]
    fn envelope_attributes_are_addressable() {
        let mut ctx = EvaluationContext::new();

        resolve(
            &[param("event_id", Some("event.id"), None, true)],
            &event(json!({"cluster_id": "c1"})),
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.get("event_id"), Some(&json!("evt-1")));
    }

    #[test]
    fn env_sources_read_the_environment() {
        let mut ctx = EvaluationContext::new();

        std::env::set_var("ADAPTER_PARAMS_TEST_REGION", "eu-west-3");

        resolve(
            &[param("region", Some("env.ADAPTER_PARAMS_TEST_REGION"), None, true)],
            &event(json!({})),
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.get("region"), Some(&json!("eu-west-3")));
    }

    #[test]
    fn defaults_fill_absent_sources() {
        let mut ctx = EvaluationContext::new();

        resolve(
            &[param(
                "region",
                Some("event.spec.region"),
                Some(json!("us-east-1")),
                true,
            )],
            &event(json!({})),
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.get("region"), Some(&json!("us-east-1")));
    }

    #[test]
    fn missing_required_parameter_is_an_error() {
        let mut ctx = EvaluationContext::new();

        let err = resolve(
            &[param("cluster_id", Some("event.cluster_id"), None, true)],
            &event(json!({})),
            &mut ctx,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Missing(name) if name == "cluster_id"));
    }

    #[test]
    fn optional_parameters_may_stay_absent() {
        let mut ctx = EvaluationContext::new();

        resolve(
            &[param("region", Some("event.spec.region"), None, false)],
            &event(json!({})),
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.get("region"), None);
    }

    #[test]
    fn dotted_names_are_stored_nested() {
        let mut ctx = EvaluationContext::new();

        resolve(
            &[param("cluster.name", Some("event.cluster_id"), None, true)],
            &event(json!({"cluster_id": "c1"})),
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.get_nested("cluster.name"), Some(&json!("c1")));
    }

    #[test]
    fn non_object_body_is_malformed_for_event_sources() {
        let mut ctx = EvaluationContext::new();

        let err = resolve(
            &[param("cluster_id", Some("event.cluster_id"), None, true)],
            &event(json!(["not", "an", "object"])),
            &mut ctx,
        )
        .unwrap_err();

        assert!(matches!(err, Error::MalformedEvent(_)));
    }
}
