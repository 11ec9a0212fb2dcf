//! # HTTP module
//!
//! This module provides the inbound HTTP surface of the daemon, event
//! ingress, health and telemetry endpoints

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};

pub mod layer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;

// -----------------------------------------------------------------------------
// Not found

#[tracing::instrument(skip_all)]
pub async fn not_found(_req: Request<Body>) -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

// -----------------------------------------------------------------------------
// Healthz

#[tracing::instrument(skip_all)]
pub async fn healthz(_req: Request<Body>) -> Response<Body> {
    let mut res = Response::default();

    let message = serde_json::json!({
        "status": "ok",
        "adapter": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    })
    .to_string();

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(message);

    res
}
