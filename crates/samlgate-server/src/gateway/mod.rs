//! Forwarding of admitted requests to the backend pool.
//!
//! - [`pool`] - Backend set and weighted round-robin selection
//! - [`transport`] - Single attempts and their classification
//! - [`forward`] - Buffering and the retry loop
//! - [`headers`] - Hop-by-hop stripping and `X-Forwarded-*`
//! - [`health`] - Optional active health checks
//! - [`stats`] - Forwarding counters

pub mod error;
pub mod forward;
pub mod headers;
pub mod health;
pub mod pool;
pub mod stats;
pub mod transport;

pub use error::GatewayError;
pub use forward::{ForwardSettings, Forwarder};
pub use headers::ClientInfo;
pub use health::HealthChecker;
pub use pool::{Backend, BackendPool};
pub use stats::{GatewayStats, StatsSnapshot};
pub use transport::{HttpTransport, Outcome, Transport};

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use samlgate_auth::AuthenticatedSubject;

use crate::server::listener::ClientAddr;
use tracing::error;

/// State of the proxy fallback handler.
#[derive(Clone)]
pub struct ProxyState {
    pub forwarder: Arc<Forwarder>,
    /// Scheme clients used to reach the gateway.
    pub proto: &'static str,
    /// Protocol path prefix. Unmatched paths below it are never forwarded.
    pub reserved_prefix: String,
}

impl ProxyState {
    fn is_reserved(&self, path: &str) -> bool {
        path.strip_prefix(self.reserved_prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

/// Forwards everything the router does not handle itself.
pub async fn proxy_handler(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    if state.is_reserved(request.uri().path()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let client = ClientInfo {
        addr: request
            .extensions()
            .get::<ConnectInfo<ClientAddr>>()
            .map(|ConnectInfo(ClientAddr(addr))| addr.ip()),
        proto: state.proto,
    };
    let subject = request
        .extensions()
        .get::<AuthenticatedSubject>()
        .map(|AuthenticatedSubject(subject)| subject.clone());

    match state
        .forwarder
        .forward(request, &client, subject.as_deref())
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "request could not be forwarded");
            e.into_response()
        }
    }
}
