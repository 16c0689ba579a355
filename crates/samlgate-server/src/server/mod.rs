//! HTTP(S) front end: routing, middleware stack and the serve loop.

pub mod listener;
pub mod middleware;
pub mod tls;

use std::{future::IntoFuture, net::SocketAddr};

use axum::{Router, middleware as axum_middleware};
use samlgate_auth::{SamlState, require_session, saml_routes};
use tokio_util::sync::CancellationToken;
use tower_http::{
    timeout::{RequestBodyTimeoutLayer, TimeoutLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::bootstrap::{AppState, StartupError};
use crate::diagnostics::{spawn_request_sweeper, spawn_stats_reporter};
use crate::gateway::{HealthChecker, ProxyState, proxy_handler};
use listener::{ClientAddr, ConnectionSettings, GatewayListener};

/// Builds the application router.
///
/// Protocol endpoints live under the SAML path prefix; everything else passes
/// the request gate and is forwarded to the backend pool.
pub fn build_router(state: &AppState) -> Router {
    let server = &state.config.server;
    let proxy = ProxyState {
        forwarder: state.forwarder.clone(),
        proto: if state.tls.is_some() { "https" } else { "http" },
        reserved_prefix: state.config.saml.path_prefix.clone(),
    };

    Router::new()
        .fallback(proxy_handler)
        .with_state(proxy)
        .merge(saml_routes(SamlState::new(
            state.provider.clone(),
            state.sessions.clone(),
        )))
        .layer(axum_middleware::from_fn_with_state(
            state.gate.clone(),
            require_session,
        ))
        .layer(RequestBodyTimeoutLayer::new(server.read_timeout))
        .layer(TimeoutLayer::new(server.write_timeout))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .headers()
                        .get(&middleware::X_REQUEST_ID)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri().path(),
                        http.status_code = Empty,
                        request_id = %req_id,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record("http.status_code", res.status().as_u16());
                        tracing::info!(
                            http.status = res.status().as_u16(),
                            elapsed_ms = latency.as_millis() as u64,
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum_middleware::from_fn(middleware::request_id))
}

/// A bound gateway, ready to serve.
pub struct GatewayServer {
    state: AppState,
    listener: GatewayListener,
    addr: SocketAddr,
}

impl GatewayServer {
    /// Binds the configured address.
    pub async fn bind(state: AppState) -> Result<Self, StartupError> {
        let requested = state.config.addr();
        let settings = ConnectionSettings {
            handshake_timeout: state.config.server.read_timeout,
            idle_timeout: state.config.server.idle_timeout,
        };
        let listener = GatewayListener::bind(requested, state.tls.clone(), settings)
            .await
            .map_err(|source| StartupError::Bind {
                addr: requested,
                source,
            })?;
        let addr = axum::serve::Listener::local_addr(&listener).map_err(|source| {
            StartupError::Bind {
                addr: requested,
                source,
            }
        })?;
        Ok(Self {
            state,
            listener,
            addr,
        })
    }

    /// Address actually bound (differs from the configured one for port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until `shutdown` is cancelled, then drains connections for at
    /// most `server.shutdown_timeout`.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self {
            state,
            listener,
            addr,
        } = self;
        let config = state.config.clone();

        let mut tasks = Vec::new();
        if config.diagnostics.enabled {
            tasks.push(spawn_stats_reporter(
                state.stats().clone(),
                state.pool().clone(),
                config.diagnostics.interval,
                shutdown.clone(),
            ));
        }
        tasks.push(spawn_request_sweeper(
            state.provider.tracker().clone(),
            config.saml.cleanup_interval,
            shutdown.clone(),
        ));
        if config.backends.health_check.enabled {
            let checker = HealthChecker::new(state.pool().clone(), &config.backends.health_check)?;
            tasks.push(checker.spawn(shutdown.clone()));
        }

        let app = build_router(&state);
        info!(
            %addr,
            tls = state.tls.is_some(),
            backends = state.pool().backends().len(),
            "gateway listening"
        );

        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ClientAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
        let drain_limit = config.server.shutdown_timeout;

        tokio::select! {
            result = serve => result?,
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(drain_limit).await;
            } => warn!(timeout = ?drain_limit, "connections still open after shutdown timeout"),
        }

        shutdown.cancel();
        for task in tasks {
            let _ = task.await;
        }
        info!("gateway stopped");
        Ok(())
    }
}
