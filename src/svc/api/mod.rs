//! # Api module
//!
//! This module provides the outbound HTTP client executing the api calls of
//! actions, with retry and backoff applied to transport errors and server
//! failures

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::svc::adapter::{self, Backoff};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to build http client, {0}")]
    Build(reqwest::Error),
    #[error("failed to parse http method '{0}'")]
    Method(String),
    #[error("failed to execute request on '{0}', {1}")]
    Request(String, reqwest::Error),
    #[error("failed to read response body from '{0}', {1}")]
    Body(String, reqwest::Error),
    #[error("request on '{url}' returned status {status}, {body}")]
    Status { url: String, status: u16, body: String },
    #[error("request on '{0}' was cancelled")]
    Cancelled(String),
}

impl Error {
    /// returns the http status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Request and Response structures

#[derive(PartialEq, Clone, Debug)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

#[derive(PartialEq, Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// -----------------------------------------------------------------------------
// ApiExecutor trait

/// seam between the action runner and the underlying http stack, production
/// uses [`Client`], tests substitute an in-memory fake
#[async_trait]
pub trait ApiExecutor: Send + Sync {
    async fn execute(
        &self,
        request: Request,
        token: &CancellationToken,
    ) -> Result<Response, Error>;
}

// -----------------------------------------------------------------------------
// Client structure

pub struct Client {
    inner: reqwest::Client,
    config: adapter::ApiClient,
}

impl Client {
    pub fn try_new(config: adapter::ApiClient) -> Result<Self, Error> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(Error::Build)?;

        Ok(Self { inner, config })
    }

    async fn once(&self, request: &Request, token: &CancellationToken) -> Result<Response, Error> {
        let url = join_url(self.config.endpoint.as_deref(), &request.url);
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| Error::Method(request.method.to_owned()))?;

        let mut builder = self.inner.request(method, &url);

        for (key, value) in self.config.headers.iter().chain(&request.headers) {
            builder = builder.header(key.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled(url)),
            result = builder.send() => result.map_err(|err| Error::Request(url.to_owned(), err))?,
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (key.to_string(), value.to_owned()))
            })
            .collect();

        let buf = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled(url)),
            result = response.text() => result.map_err(|err| Error::Body(url.to_owned(), err))?,
        };

        let body = match serde_json::from_str(&buf) {
            Ok(body) => body,
            Err(_) if buf.is_empty() => Value::Null,
            Err(_) => Value::from(buf),
        };

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl ApiExecutor for Client {
    async fn execute(
        &self,
        request: Request,
        token: &CancellationToken,
    ) -> Result<Response, Error> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let retriable = match self.once(&request, token).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if response.status >= 500 && attempt < retry.attempts => {
                    Error::Status {
                        url: request.url.to_owned(),
                        status: response.status,
                        body: response.body.to_string(),
                    }
                }
                Ok(response) => {
                    return Err(Error::Status {
                        url: request.url.to_owned(),
                        status: response.status,
                        body: response.body.to_string(),
                    })
                }
                Err(err @ Error::Request(..)) if attempt < retry.attempts => err,
                Err(err) => return Err(err),
            };

            let delay = delay(retry, attempt);

            warn!(
                url = &request.url,
                attempt = attempt,
                delay = format!("{}ms", delay.as_millis()),
                error = retriable.to_string(),
                "Request failed, retrying after backoff",
            );

            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled(request.url.to_owned())),
                _ = tokio::time::sleep(delay) => {}
            }

            debug!(url = &request.url, attempt = attempt + 1, "Retrying request");
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// joins a possibly relative url with the configured endpoint
pub fn join_url(endpoint: Option<&str>, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_owned();
    }

    match endpoint {
        None => url.to_owned(),
        Some(endpoint) => format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            url.trim_start_matches('/')
        ),
    }
}

/// computes the delay before the next attempt from the retry policy
pub fn delay(retry: &adapter::Retry, attempt: u32) -> Duration {
    let base = retry.base_delay;

    let millis = match retry.backoff {
        Backoff::Constant => base,
        Backoff::Linear => base.saturating_mul(attempt as u64),
        Backoff::Exponential => base.saturating_mul(1u64 << (attempt - 1).min(32)),
    };

    Duration::from_millis(millis.min(retry.max_delay))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{delay, join_url};
    use crate::svc::adapter::{Backoff, Retry};

    fn retry(backoff: Backoff) -> Retry {
        Retry {
            attempts: 5,
            backoff,
            base_delay: 100,
            max_delay: 1_000,
        }
    }

    #[test]
    fn join_url_prefixes_relative_urls() {
        assert_eq!(
            join_url(Some("https://api.example.com/"), "/v1/clusters"),
            "https://api.example.com/v1/clusters"
        );
        assert_eq!(
            join_url(Some("https://api.example.com"), "https://other.example.com/x"),
            "https://other.example.com/x"
        );
        assert_eq!(join_url(None, "/v1/clusters"), "/v1/clusters");
    }

    #[test]
    fn backoff_strategies_grow_as_documented() {
        assert_eq!(delay(&retry(Backoff::Constant), 3), Duration::from_millis(100));
        assert_eq!(delay(&retry(Backoff::Linear), 3), Duration::from_millis(300));
        assert_eq!(delay(&retry(Backoff::Exponential), 3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_capped_by_the_max_delay() {
        assert_eq!(
            delay(&retry(Backoff::Exponential), 12),
            Duration::from_millis(1_000)
        );
    }
}
