//! # Prometheus module
//!
//! This module exports the adapter telemetry, pipeline outcomes, phase
//! errors and access counters, in prometheus text format

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, Response, StatusCode},
};
use prometheus::{Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// handler

#[tracing::instrument(skip_all)]
pub async fn handler(_req: Request<Body>) -> Response<Body> {
    match gather() {
        Ok(buf) => respond(StatusCode::OK, mime::TEXT_PLAIN_UTF_8.as_ref(), buf),
        Err(err) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            mime::APPLICATION_JSON.as_ref(),
            serde_json::json!({"error": err.to_string()})
                .to_string()
                .into_bytes(),
        ),
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// encodes every metric family registered on the default registry
fn gather() -> Result<Vec<u8>, prometheus::Error> {
    let mut buf = vec![];

    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    Ok(buf)
}

fn respond(status: StatusCode, content_type: &str, buf: Vec<u8>) -> Response<Body> {
    let mut res = Response::default();
    let headers = res.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type).expect("mime constant to be iso8859-1 compliant"),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&buf.len().to_string())
            .expect("content-length to be iso8859-1 compliant"),
    );

    *res.status_mut() = status;
    *res.body_mut() = Body::from(buf);

    res
}
