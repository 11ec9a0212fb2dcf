//! # Server module
//!
//! This module provides the HTTP server receiving CloudEvents from the
//! broker and exposing health and telemetry endpoints

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::svc::{cfg::Configuration, event::Event, http::layer, pipeline::Pipeline};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, std::net::AddrParseError),
    #[error("failed to bind server, {0}")]
    Bind(std::io::Error),
    #[error("failed to serve content, {0}")]
    Serve(std::io::Error),
}

// -----------------------------------------------------------------------------
// Ingress structure

/// shared state of the ingress handlers
#[derive(Clone)]
pub struct Ingress {
    pub pipeline: Arc<Pipeline>,
    pub token: CancellationToken,
}

impl Ingress {
    pub fn new(pipeline: Arc<Pipeline>, token: CancellationToken) -> Self {
        Self { pipeline, token }
    }
}

// -----------------------------------------------------------------------------
// Serve function

#[tracing::instrument(skip_all)]
pub async fn serve(config: Arc<Configuration>, ingress: Ingress) -> Result<(), Error> {
    let addr: SocketAddr = config
        .operator
        .listen
        .parse()
        .map_err(|err| Error::Listen(config.operator.listen.to_owned(), err))?;

    let router = Router::new()
        .route("/healthz", get(super::healthz))
        .route("/v1/events", post(events));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(super::metrics::handler));

    let router = router
        .fallback(super::not_found)
        .layer(middleware::from_fn(layer::access))
        .with_state(ingress.to_owned());

    info!("Start to listen for http request on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(Error::Bind)?;

    let shutdown = ingress.token.to_owned();

    std::future::IntoFuture::into_future(
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await }),
    )
    .instrument(tracing::info_span!("Server::serve"))
    .await
    .map_err(Error::Serve)
}

// -----------------------------------------------------------------------------
// Event ingress

/// CloudEvents ingress. A structurally broken event is rejected with a
/// client error, everything else is acknowledged once the pipeline
/// completes, whatever the internal status, so the broker never redelivers
/// a malformed event.
#[tracing::instrument(skip_all)]
async fn events(State(ingress): State<Ingress>, Json(event): Json<Event>) -> Response {
    if let Err(err) = event.validate() {
        warn!(error = err.to_string(), "Discard malformed event");

        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response();
    }

    let record = ingress.pipeline.handle(&ingress.token, &event).await;

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "eventId": record.event_id,
            "status": record.status,
            "terminalPhase": record.terminal_phase,
        })),
    )
        .into_response()
}
