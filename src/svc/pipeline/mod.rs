//! # Pipeline module
//!
//! This module sequences the per-event state machine, parameter extraction,
//! preconditions, resource reconciliation and post-actions, maintaining the
//! execution record and the failure semantics of each phase

#[cfg(feature = "metrics")]
use std::sync::LazyLock;
use std::{sync::Arc, time::Duration};

#[cfg(feature = "metrics")]
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::svc::{
    adapter::{Document, Payload},
    api::{self, ApiExecutor},
    context::EvaluationContext,
    event::Event,
    expr::cel,
    k8s::Transport,
    template::{self, Mode},
};

pub mod action;
pub mod params;
pub mod resource;
pub mod result;

use self::result::{
    Execution, Phase, Status, StepResult, REASON_CANCELLED, REASON_CONDITION_EVAL, REASON_HTTP,
    REASON_MALFORMED_EVENT, REASON_MISSING_PARAMETER, REASON_PAYLOAD_BUILD, REASON_RESOURCE_APPLY,
};

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static PIPELINE_EVENT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "adapter_pipeline_events_count",
        "Number of processed events",
        &["status"]
    )
    .expect("'adapter_pipeline_events_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static PIPELINE_PHASE_ERROR: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "adapter_pipeline_phase_errors_count",
        "Number of errors recorded per phase",
        &["phase"]
    )
    .expect("'adapter_pipeline_phase_errors_count' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to build pipeline, no {0} was provided")]
    Builder(&'static str),
    #[error("failed to render field '{0}' of payload '{1}', {2}")]
    PayloadTemplate(String, String, template::Error),
    #[error("failed to evaluate field '{0}' of payload '{1}', {2}")]
    PayloadExpression(String, String, cel::Error),
}

// -----------------------------------------------------------------------------
// Builder structure

/// explicit builder wiring the configuration and the external clients into
/// an orchestrator, no process-wide state is involved
#[derive(Default)]
pub struct Builder {
    document: Option<Arc<Document>>,
    executor: Option<Arc<dyn ApiExecutor>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Builder {
    pub fn document(mut self, document: Arc<Document>) -> Self {
        self.document = Some(document);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ApiExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Pipeline, Error> {
        let document = self.document.ok_or(Error::Builder("document"))?;
        let executor = self.executor.ok_or(Error::Builder("executor"))?;
        let transport = self.transport.ok_or(Error::Builder("transport"))?;

        let reconciler = resource::Reconciler::new(
            transport,
            document.spec.adapter.default_namespace.to_owned(),
        );

        Ok(Pipeline {
            document,
            executor,
            reconciler,
        })
    }
}

// -----------------------------------------------------------------------------
// Pipeline structure

pub struct Pipeline {
    document: Arc<Document>,
    executor: Arc<dyn ApiExecutor>,
    reconciler: resource::Reconciler,
}

impl Pipeline {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// processes one event through the state machine and returns its
    /// execution record. The record never escalates into a handler error,
    /// malformed events are acknowledged so the broker does not redeliver
    /// them.
    pub async fn handle(&self, token: &CancellationToken, event: &Event) -> Execution {
        let mut ctx = EvaluationContext::new();
        let mut record = Execution::new(&event.id);

        info!(
            event = &event.id,
            kind = &event.kind,
            source = &event.source,
            "Process event",
        );

        // ---------------------------------------------------------------------
        // Derive the run token, capped by the per-pipeline timeout
        let run = token.child_token();
        let watchdog = self.document.spec.adapter.timeout.map(|secs| {
            let deadline = run.to_owned();

            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                deadline.cancel();
            })
        });

        self.run(&run, event, &mut ctx, &mut record).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        // ---------------------------------------------------------------------
        // Finalize the record and the context mirror
        record.status = if record.has_errors() {
            Status::Failed
        } else {
            Status::Success
        };

        ctx.set_execution_status(&record.status.to_string());
        record.context = ctx.to_value();

        #[cfg(feature = "metrics")]
        PIPELINE_EVENT
            .with_label_values(&[&record.status.to_string()])
            .inc();

        match record.status {
            Status::Success => info!(
                event = &event.id,
                phase = record.terminal_phase.to_string(),
                "Processed event",
            ),
            Status::Failed => error!(
                event = &event.id,
                phase = record.terminal_phase.to_string(),
                errors = record.errors.len(),
                "Failed to process event",
            ),
        }

        record
    }

    async fn run(
        &self,
        token: &CancellationToken,
        event: &Event,
        ctx: &mut EvaluationContext,
        record: &mut Execution,
    ) {
        let spec = &self.document.spec;

        // ---------------------------------------------------------------------
        // Phase 1: parameter extraction, a failure here skips every later
        // phase including post-actions
        record.terminal_phase = Phase::ParamExtract;

        if let Err(err) = event.validate() {
            self.fail(ctx, record, Phase::ParamExtract, "event", REASON_MALFORMED_EVENT, &err.to_string());
            return;
        }

        if let Err(err) = params::resolve(&spec.params, event, ctx) {
            let reason = match &err {
                params::Error::Missing(_) => REASON_MISSING_PARAMETER,
                params::Error::MalformedEvent(_) => REASON_MALFORMED_EVENT,
            };

            self.fail(ctx, record, Phase::ParamExtract, "params", reason, &err.to_string());
            return;
        }

        record.params = ctx.values().to_owned();

        // ---------------------------------------------------------------------
        // Phase 2: preconditions
        record.terminal_phase = Phase::Preconditions;

        let mut skip_resources = false;
        let mut errored = false;

        for (index, precondition) in spec.preconditions.iter().enumerate() {
            let name = precondition.display_name(index);

            match action::run(self.executor.as_ref(), precondition, &name, ctx, token, true).await
            {
                Ok(outcome) => {
                    let evaluation = outcome
                        .evaluation
                        .expect("gated actions to always produce an evaluation");

                    if evaluation.matched {
                        record.preconditions.push(StepResult::succeeded(name));
                        continue;
                    }

                    let reason = format!(
                        "precondition '{}' did not match, condition {}",
                        name, evaluation.failed_condition_index,
                    );

                    info!(event = &event.id, precondition = &name, "Skip resources, {}", reason);

                    ctx.set_resources_skipped(true, &reason);
                    record.resources_skipped = true;
                    record.preconditions.push(StepResult::not_matched(name));
                    skip_resources = true;
                    break;
                }
                Err(err) => {
                    self.fail(
                        ctx,
                        record,
                        Phase::Preconditions,
                        &name,
                        classify(&err),
                        &err.to_string(),
                    );

                    record.preconditions.push(StepResult::failed(name, err.to_string()));
                    errored = true;
                    break;
                }
            }
        }

        if !skip_resources {
            ctx.set_resources_skipped(false, "");
        }

        // ---------------------------------------------------------------------
        // Phase 3: resources, partial failures are recorded and the
        // remaining resources still reconcile so the report carries all of
        // them
        if !skip_resources && !errored {
            record.terminal_phase = Phase::Resources;

            for resource in &spec.resources {
                match self.reconciler.apply(resource, ctx, token).await {
                    Ok(applied) => {
                        let mut step = StepResult::succeeded(resource.name.to_owned());
                        step.operation = applied.first().map(|entry| entry.operation);
                        record.resources.push(step);
                    }
                    Err(err) => {
                        let reason = if err.is_cancelled() {
                            REASON_CANCELLED
                        } else {
                            REASON_RESOURCE_APPLY
                        };

                        self.fail(ctx, record, Phase::Resources, &resource.name, reason, &err.to_string());

                        record
                            .resources
                            .push(StepResult::failed(resource.name.to_owned(), err.to_string()));

                        if err.is_cancelled() || token.is_cancelled() {
                            break;
                        }
                    }
                }
            }
        }

        // ---------------------------------------------------------------------
        // Phase 4: post, payloads first, then the report actions
        record.terminal_phase = Phase::PostActions;

        // interim status so payloads and reports can reference it
        let interim = if record.has_errors() {
            Status::Failed
        } else {
            Status::Success
        };
        ctx.set_execution_status(&interim.to_string());

        for payload in &spec.post.payloads {
            match build_payload(payload, ctx) {
                Ok(value) => {
                    ctx.set_nested(&format!("payloads.{}", payload.name), value);
                }
                Err(err) => {
                    warn!(
                        event = &event.id,
                        payload = &payload.name,
                        error = err.to_string(),
                        "Payload build failed, post actions are blocked",
                    );

                    self.fail(
                        ctx,
                        record,
                        Phase::PostActions,
                        &payload.name,
                        REASON_PAYLOAD_BUILD,
                        &err.to_string(),
                    );

                    return;
                }
            }
        }

        for (index, post) in spec.post.post_actions.iter().enumerate() {
            let name = post.display_name(index);

            match action::run(self.executor.as_ref(), post, &name, ctx, token, false).await {
                Ok(_) => record.post_actions.push(StepResult::succeeded(name)),
                Err(err) => {
                    self.fail(
                        ctx,
                        record,
                        Phase::PostActions,
                        &name,
                        classify(&err),
                        &err.to_string(),
                    );

                    record.post_actions.push(StepResult::failed(name, err.to_string()));

                    // cancellation during post-actions is terminal
                    if err.is_cancelled() || token.is_cancelled() {
                        break;
                    }
                }
            }
        }
    }

    /// records the error into the record, the context mirror and the phase
    /// metric, the first error wins in the mirror
    fn fail(
        &self,
        ctx: &mut EvaluationContext,
        record: &mut Execution,
        phase: Phase,
        step: &str,
        reason: &str,
        message: &str,
    ) {
        error!(
            phase = phase.to_string(),
            step = step,
            reason = reason,
            error = message,
            "Phase error",
        );

        record.record_error(phase, message.to_owned());
        ctx.record_execution_error(&phase.to_string(), step, reason, message);

        #[cfg(feature = "metrics")]
        PIPELINE_PHASE_ERROR
            .with_label_values(&[&phase.to_string()])
            .inc();
    }
}

// -----------------------------------------------------------------------------
// Payload builder

/// builds a structured payload field by field, `value` fields render as
/// text, required ones strictly, `expression` fields evaluate to any json
/// value
fn build_payload(payload: &Payload, ctx: &EvaluationContext) -> Result<Value, Error> {
    let mut scratch = EvaluationContext::new();

    for field in &payload.fields {
        let value = match (&field.value, &field.expression) {
            (Some(template), _) => {
                let mode = if field.required {
                    Mode::Strict
                } else {
                    Mode::Lenient
                };

                Value::from(template::render(template, ctx, mode).map_err(|err| {
                    Error::PayloadTemplate(field.path.to_owned(), payload.name.to_owned(), err)
                })?)
            }
            (_, Some(expression)) => cel::evaluate(expression, ctx)
                .map_err(|err| {
                    Error::PayloadExpression(field.path.to_owned(), payload.name.to_owned(), err)
                })?
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };

        scratch.set_nested(&field.path, value);
    }

    Ok(scratch.to_value())
}

/// maps an action error onto the reason mirrored into 'adapter.errorReason'
fn classify(err: &action::Error) -> &'static str {
    match err {
        action::Error::Api(_, api::Error::Cancelled(_)) => REASON_CANCELLED,
        action::Error::Api(..) => REASON_HTTP,
        action::Error::Template(..) | action::Error::Capture(..) | action::Error::Gate(..) => {
            REASON_CONDITION_EVAL
        }
    }
}
