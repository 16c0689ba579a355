//! Assembles the gateway from validated configuration.
//!
//! Reads trust material from disk, wires the SAML engine, session issuer,
//! request gate and backend pool together, and loads TLS credentials when
//! HTTPS is configured. Any failure here is a startup error.

use std::{path::Path, sync::Arc};

use axum::http::HeaderName;
use samlgate_auth::{
    InMemoryRequestTracker, RequestGate, ServiceProvider, ServiceProviderKeys, ServiceUrls,
    SessionError, SessionManager, TrustError, TrustStore, metadata::parse_idp_metadata,
};
use tracing::info;

use crate::config::{AppConfig, ConfigError};
use crate::gateway::{BackendPool, ForwardSettings, Forwarder, GatewayStats, HttpTransport};
use crate::server::tls::{TlsError, load_server_config};

/// Errors that stop the gateway from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid service URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("trust material: {0}")]
    Trust(#[from] TrustError),

    #[error("session keys: {0}")]
    Session(#[from] SessionError),

    #[error("HTTPS: {0}")]
    Tls(#[from] TlsError),

    #[error("HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
}

/// Shared components of a running gateway.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub provider: Arc<ServiceProvider>,
    pub sessions: Arc<SessionManager>,
    pub gate: Arc<RequestGate>,
    pub forwarder: Arc<Forwarder>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl AppState {
    pub fn pool(&self) -> &Arc<BackendPool> {
        self.forwarder.pool()
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        self.forwarder.stats()
    }
}

fn read_file(path: &Path) -> Result<String, StartupError> {
    std::fs::read_to_string(path).map_err(|source| StartupError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn required<'a>(
    field: &str,
    value: &'a Option<std::path::PathBuf>,
) -> Result<&'a Path, StartupError> {
    value.as_deref().ok_or_else(|| {
        StartupError::Config(ConfigError::Invalid {
            field: field.to_string(),
            message: "is required".to_string(),
        })
    })
}

/// Builds every component from `config`.
pub fn build_state(config: AppConfig) -> Result<AppState, StartupError> {
    let service = &config.service;
    let root = service.root_url()?;
    let urls = ServiceUrls::new(&root, &config.saml.path_prefix)?;

    let idp = parse_idp_metadata(&read_file(required(
        "service.idp_metadata",
        &service.idp_metadata,
    )?)?)?;
    let sp_keys = ServiceProviderKeys::from_pem(
        &read_file(required("service.key", &service.key)?)?,
        &read_file(required("service.certificate", &service.certificate)?)?,
    )?;
    let trust = Arc::new(TrustStore::new(idp, sp_keys)?);
    info!(
        idp = %trust.idp().entity_id,
        signing_certificates = trust.idp_signing_keys().len(),
        "trust material loaded"
    );

    let sessions = Arc::new(SessionManager::new(
        trust.service_provider(),
        urls.entity_id.as_str(),
        &config.session,
        urls.is_secure(),
    )?);
    let tracker = Arc::new(InMemoryRequestTracker::new(config.saml.request_lifetime));
    let gate = Arc::new(RequestGate::new(
        sessions.clone(),
        &urls,
        &config.saml.path_prefix,
    ));
    let provider = Arc::new(ServiceProvider::new(
        trust,
        urls,
        config.saml.clone(),
        tracker,
    ));

    let pool = Arc::new(BackendPool::new());
    for target in &config.backends.targets {
        pool.add_target(target.parsed_url()?, target.weight);
    }
    let settings = ForwardSettings {
        max_attempts: config.backends.max_attempts,
        attempt_timeout: config.backends.attempt_timeout,
        max_buffer_bytes: config.backends.max_buffer_bytes,
        subject_header: config
            .backends
            .subject_header
            .as_deref()
            .and_then(|name| HeaderName::try_from(name).ok()),
    };
    let forwarder = Arc::new(Forwarder::new(
        pool,
        Arc::new(HttpTransport::new()?),
        Arc::new(GatewayStats::new()),
        settings,
    ));

    let tls = match (&config.tls.certificate, &config.tls.key) {
        (Some(certificate), Some(key)) => Some(load_server_config(certificate, key)?),
        _ => None,
    };

    Ok(AppState {
        config: Arc::new(config),
        provider,
        sessions,
        gate,
        forwarder,
        tls,
    })
}
