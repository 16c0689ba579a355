//! Dispatch of single upstream attempts.
//!
//! A [`Transport`] sends one request to one backend and classifies the
//! result. Only [`Outcome::NetworkError`] means no response was received;
//! the forwarder retries those and nothing else.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode},
};
use bytes::Bytes;
use futures_util::TryStreamExt;
use reqwest::redirect::Policy;
use url::Url;

/// Request body for one attempt.
pub enum UpstreamBody {
    /// Fully read body; can be replayed for another attempt.
    Buffered(Bytes),
    /// Body still arriving from the client; usable once.
    Streaming(Body),
}

/// One request addressed to one backend.
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

/// Response head and streaming body from a backend.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Failure before a response head was received.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(String),
}

/// Classified result of one attempt.
pub enum Outcome {
    /// A 1xx, 2xx or 3xx response.
    Success(UpstreamResponse),
    /// A 4xx or 5xx response. Still a response, passed through unchanged.
    ApplicationError(UpstreamResponse),
    /// No response.
    NetworkError(NetworkError),
}

impl Outcome {
    pub fn from_response(response: UpstreamResponse) -> Self {
        if response.status.is_client_error() || response.status.is_server_error() {
            Self::ApplicationError(response)
        } else {
            Self::Success(response)
        }
    }
}

/// Sends single attempts to backends.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request`, giving up with [`NetworkError::Timeout`] if the
    /// response head does not arrive within `timeout`.
    async fn send(&self, request: UpstreamRequest, timeout: Duration) -> Outcome;
}

/// [`Transport`] over a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Redirects are returned to the browser, never followed.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: UpstreamRequest, timeout: Duration) -> Outcome {
        let body = match request.body {
            UpstreamBody::Buffered(bytes) => reqwest::Body::from(bytes),
            UpstreamBody::Streaming(body) => reqwest::Body::wrap_stream(body.into_data_stream()),
        };
        let upstream = match self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers)
            .body(body)
            .build()
        {
            Ok(upstream) => upstream,
            Err(e) => return Outcome::NetworkError(NetworkError::Request(e.to_string())),
        };

        // The timeout covers the response head; the body streams afterwards.
        let response = match tokio::time::timeout(timeout, self.client.execute(upstream)).await {
            Err(_) => return Outcome::NetworkError(NetworkError::Timeout(timeout)),
            Ok(Err(e)) if e.is_connect() => {
                return Outcome::NetworkError(NetworkError::Connect(e.to_string()));
            }
            Ok(Err(e)) => return Outcome::NetworkError(NetworkError::Request(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = Body::from_stream(response.bytes_stream().map_err(std::io::Error::other));
        Outcome::from_response(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
