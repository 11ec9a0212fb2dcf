//! # Action module
//!
//! This module provides the uniform executor for actions, the optional log,
//! api call and capture sub-steps run in fixed order. Preconditions add a
//! condition gate on top, post-actions run the same record without one.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::svc::{
    adapter::{Action, LogLevel},
    api::{self, ApiExecutor, Request},
    context::{navigate, EvaluationContext},
    expr::{self, cel, Evaluation},
    template::{self, Mode},
};

// -----------------------------------------------------------------------------
// Constants

/// key the api call response body is exposed under for captures
pub const RESPONSE_KEY: &str = "response";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to render template of action '{0}', {1}")]
    Template(String, template::Error),
    #[error("failed to execute api call of action '{0}', {1}")]
    Api(String, api::Error),
    #[error("failed to evaluate capture '{0}' of action '{1}', {2}")]
    Capture(String, String, cel::Error),
    #[error("failed to evaluate gate of action '{0}', {1}")]
    Gate(String, expr::Error),
}

impl Error {
    /// returns the http status carried by the underlying api error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(_, err) => err.status(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Api(_, api::Error::Cancelled(_)))
    }
}

// -----------------------------------------------------------------------------
// Outcome structure

#[derive(Debug)]
pub struct Outcome {
    /// gate evaluation, `None` for gateless actions
    pub evaluation: Option<Evaluation>,
    pub response: Option<api::Response>,
}

// -----------------------------------------------------------------------------
// Runner function

/// executes the action against the context. Captures land in the context in
/// declaration order so each may reference the ones before it. When `gated`
/// is set the conditions or expression of the action are evaluated last.
pub async fn run(
    executor: &dyn ApiExecutor,
    action: &Action,
    name: &str,
    ctx: &mut EvaluationContext,
    token: &CancellationToken,
    gated: bool,
) -> Result<Outcome, Error> {
    // -------------------------------------------------------------------------
    // Step 1: emit the configured log line
    if let Some(log) = &action.log {
        let message = template::render(&log.message, ctx, Mode::Lenient)
            .map_err(|err| Error::Template(name.to_owned(), err))?;

        match log.level {
            LogLevel::Debug => debug!(action = name, "{}", message),
            LogLevel::Info => info!(action = name, "{}", message),
            LogLevel::Warn => warn!(action = name, "{}", message),
            LogLevel::Error => error!(action = name, "{}", message),
        }
    }

    // -------------------------------------------------------------------------
    // Step 2: issue the api call
    let response = match &action.api_call {
        None => None,
        Some(call) => {
            let url = template::render(&call.url, ctx, Mode::Lenient)
                .map_err(|err| Error::Template(name.to_owned(), err))?;

            let mut headers = std::collections::BTreeMap::new();
            for (key, value) in &call.headers {
                headers.insert(
                    key.to_owned(),
                    template::render(value, ctx, Mode::Lenient)
                        .map_err(|err| Error::Template(name.to_owned(), err))?,
                );
            }

            let body = match &call.body {
                None => None,
                Some(body) => Some(
                    template::render_value(body, ctx, Mode::Lenient)
                        .map_err(|err| Error::Template(name.to_owned(), err))?,
                ),
            };

            debug!(action = name, method = &call.method, url = &url, "Execute api call");

            let response = executor
                .execute(
                    Request {
                        method: call.method.to_owned(),
                        url,
                        headers,
                        body,
                        timeout: call.timeout.map(Duration::from_secs),
                    },
                    token,
                )
                .await
                .map_err(|err| Error::Api(name.to_owned(), err))?;

            if let Some(key) = &call.store_response_as {
                ctx.set(key, response.body.to_owned());
            }

            Some(response)
        }
    };

    // -------------------------------------------------------------------------
    // Step 3: evaluate captures against the context extended with the
    // response body
    if !action.capture.is_empty() {
        let mut scope = ctx.to_owned();

        if let Some(response) = &response {
            scope.set(RESPONSE_KEY, response.body.to_owned());

            if let Value::Object(body) = &response.body {
                for (key, value) in body {
                    scope.set(key, value.to_owned());
                }
            }
        }

        for capture in &action.capture {
            let value = match (&capture.field, &capture.expression) {
                (Some(field), _) => {
                    let body = response
                        .as_ref()
                        .map(|response| &response.body)
                        .unwrap_or(&Value::Null);

                    field_lookup(body, field).cloned().unwrap_or(Value::Null)
                }
                (_, Some(expression)) => cel::evaluate(expression, &scope)
                    .map_err(|err| {
                        Error::Capture(capture.name.to_owned(), name.to_owned(), err)
                    })?
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            };

            debug!(action = name, capture = &capture.name, "Captured field");

            if capture.name.contains('.') {
                scope.set_nested(&capture.name, value.to_owned());
                ctx.set_nested(&capture.name, value);
            } else {
                scope.set(&capture.name, value.to_owned());
                ctx.set(&capture.name, value);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Step 4: evaluate the gate
    let evaluation = match gated {
        false => None,
        true => Some(if let Some(expression) = &action.expression {
            expr::evaluate_expression(expression, ctx)
                .map_err(|err| Error::Gate(name.to_owned(), err))?
        } else {
            expr::evaluate_conditions(&action.conditions, ctx)
                .map_err(|err| Error::Gate(name.to_owned(), err))?
        }),
    };

    Ok(Outcome {
        evaluation,
        response,
    })
}

fn field_lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = root;

    for segment in path.split('.') {
        cursor = navigate(cursor, segment)?;
    }

    Some(cursor)
}

#[cfg(test)]
pub mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use super::{run, Error};
    use crate::svc::{
        adapter::{Action, ApiCall, Capture, Log, LogLevel},
        api::{self, ApiExecutor, Request, Response},
        context::EvaluationContext,
        expr::{Condition, Operator},
    };

    // -------------------------------------------------------------------------
    // In-memory executor recording requests and replaying canned responses

    #[derive(Default)]
    pub struct FakeExecutor {
        pub requests: Mutex<Vec<Request>>,
        pub responses: Mutex<Vec<Result<Response, u16>>>,
    }

    impl FakeExecutor {
        pub fn replying(responses: Vec<Result<Response, u16>>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(vec![]),
                responses: Mutex::new(responses),
            })
        }

        pub fn ok(body: Value) -> Arc<Self> {
            Self::replying(vec![Ok(Response {
                status: 200,
                headers: BTreeMap::new(),
                body,
            })])
        }
    }

    #[async_trait]
    impl ApiExecutor for FakeExecutor {
        async fn execute(
            &self,
            request: Request,
            token: &CancellationToken,
        ) -> Result<Response, api::Error> {
            let url = request.url.to_owned();

            if token.is_cancelled() {
                return Err(api::Error::Cancelled(url));
            }

            self.requests
                .lock()
                .expect("requests mutex to not be poisoned")
                .push(request);

            let mut responses = self
                .responses
                .lock()
                .expect("responses mutex to not be poisoned");

            match responses.remove(0) {
                Ok(response) => Ok(response),
                Err(status) => Err(api::Error::Status {
                    url,
                    status,
                    body: "{}".to_owned(),
                }),
            }
        }
    }

    fn cluster_body() -> Value {
        json!({
            "status": {
                "conditions": [{"type": "Ready", "status": "True"}],
            },
            "spec": {"region": "us-east-1"},
        })
    }

    fn probe_action() -> Action {
        Action {
            name: Some("cluster-ready".to_owned()),
            log: Some(Log {
                level: LogLevel::Info,
                message: "Probe cluster {{ .cluster_id }}".to_owned(),
            }),
            api_call: Some(ApiCall {
                method: "GET".to_owned(),
                url: "/api/v1/clusters/{{ .cluster_id }}".to_owned(),
                headers: BTreeMap::new(),
                body: None,
                timeout: None,
                store_response_as: Some("cluster".to_owned()),
            }),
            capture: vec![Capture {
                name: "readyConditionStatus".to_owned(),
                field: None,
                expression: Some(
                    "status.conditions.filter(c, c.type == \"Ready\")[0].status".to_owned(),
                ),
            }],
            conditions: vec![Condition {
                field: "readyConditionStatus".to_owned(),
                operator: Operator::Equals,
                value: json!("True"),
            }],
            expression: None,
        }
    }

    #[tokio::test]
    async fn api_call_renders_url_and_exposes_the_response() {
        let executor = FakeExecutor::ok(cluster_body());
        let mut ctx = EvaluationContext::new();
        ctx.set("cluster_id", json!("c1"));

        let outcome = run(
            executor.as_ref(),
            &probe_action(),
            "cluster-ready",
            &mut ctx,
            &CancellationToken::new(),
            true,
        )
        .await
        .unwrap();

        let requests = executor.requests.lock().unwrap();
        assert_eq!(requests[0].url, "/api/v1/clusters/c1");

        assert!(outcome.evaluation.unwrap().matched);
        assert_eq!(ctx.get_nested("readyConditionStatus"), Some(&json!("True")));
        assert_eq!(
            ctx.get_nested("cluster.spec.region"),
            Some(&json!("us-east-1"))
        );
    }

    #[tokio::test]
    async fn captures_reference_earlier_captures() {
        let executor = FakeExecutor::ok(cluster_body());
        let mut ctx = EvaluationContext::new();
        ctx.set("cluster_id", json!("c1"));

        let mut action = probe_action();
        action.capture.push(Capture {
            name: "ready".to_owned(),
            field: None,
            expression: Some("readyConditionStatus == \"True\"".to_owned()),
        });

        run(
            executor.as_ref(),
            &action,
            "cluster-ready",
            &mut ctx,
            &CancellationToken::new(),
            true,
        )
        .await
        .unwrap();

        assert_eq!(ctx.get("ready"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn field_captures_read_the_response_body() {
        let executor = FakeExecutor::ok(cluster_body());
        let mut ctx = EvaluationContext::new();
        ctx.set("cluster_id", json!("c1"));

        let mut action = probe_action();
        action.capture = vec![Capture {
            name: "region".to_owned(),
            field: Some("spec.region".to_owned()),
            expression: None,
        }];
        action.conditions = vec![Condition {
            field: "region".to_owned(),
            operator: Operator::Exists,
            value: Value::Null,
        }];

        let outcome = run(
            executor.as_ref(),
            &action,
            "cluster-ready",
            &mut ctx,
            &CancellationToken::new(),
            true,
        )
        .await
        .unwrap();

        assert!(outcome.evaluation.unwrap().matched);
        assert_eq!(ctx.get("region"), Some(&json!("us-east-1")));
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let executor = FakeExecutor::replying(vec![Err(404)]);
        let mut ctx = EvaluationContext::new();
        ctx.set("cluster_id", json!("c1"));

        let err = run(
            executor.as_ref(),
            &probe_action(),
            "cluster-ready",
            &mut ctx,
            &CancellationToken::new(),
            true,
        )
        .await
        .unwrap_err();

        assert!(matches!(&err, Error::Api(..)));
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn gateless_actions_skip_evaluation() {
        let executor = FakeExecutor::ok(json!({}));
        let mut ctx = EvaluationContext::new();

        let mut action = probe_action();
        action.conditions = vec![];
        action.capture = vec![];

        let outcome = run(
            executor.as_ref(),
            &action,
            "report",
            &mut ctx,
            &CancellationToken::new(),
            false,
        )
        .await
        .unwrap();

        assert!(outcome.evaluation.is_none());
    }
}
