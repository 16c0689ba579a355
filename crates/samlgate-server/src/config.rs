use axum::http::HeaderName;
use samlgate_auth::{SamlConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration sources could not be merged.
    #[error("config build error: {0}")]
    Build(String),

    /// The merged configuration does not match the expected shape.
    #[error("config deserialize error: {0}")]
    Deserialize(String),

    /// A value failed validation.
    #[error("{field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<samlgate_auth::ConfigError> for ConfigError {
    fn from(e: samlgate_auth::ConfigError) -> Self {
        match e {
            samlgate_auth::ConfigError::InvalidValue { field, message } => {
                Self::Invalid { field, message }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// HTTPS listener credentials
    #[serde(default)]
    pub tls: TlsConfig,
    /// Service provider identity and trust material
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub saml: SamlConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Upstream servers and proxy behavior
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Periodic runtime statistics
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Server validations
        if self.server.host.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::invalid("server.host", "must be an IP address"));
        }
        for (field, value) in [
            ("server.read_timeout", self.server.read_timeout),
            ("server.write_timeout", self.server.write_timeout),
            ("server.idle_timeout", self.server.idle_timeout),
            ("backends.attempt_timeout", self.backends.attempt_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be > 0"));
            }
        }

        // TLS requires both halves
        if self.tls.certificate.is_some() != self.tls.key.is_some() {
            return Err(ConfigError::invalid(
                "tls",
                "certificate and key must be set together",
            ));
        }
        if let (Some(cert), Some(key)) = (&self.tls.certificate, &self.tls.key) {
            require_file("tls.certificate", cert)?;
            require_file("tls.key", key)?;
        }

        // Service identity
        let root = self.service.root_url()?;
        if !matches!(root.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "service.root_url",
                "must be an http or https URL",
            ));
        }
        require_file(
            "service.certificate",
            required("service.certificate", &self.service.certificate)?,
        )?;
        require_file("service.key", required("service.key", &self.service.key)?)?;
        require_file(
            "service.idp_metadata",
            required("service.idp_metadata", &self.service.idp_metadata)?,
        )?;

        self.saml.validate()?;
        self.session.validate()?;

        // Backends
        if self.backends.targets.is_empty() {
            return Err(ConfigError::invalid(
                "backends.targets",
                "at least one target is required",
            ));
        }
        for target in &self.backends.targets {
            target.parsed_url()?;
            if target.weight == 0 || target.weight > MAX_TARGET_WEIGHT {
                return Err(ConfigError::invalid(
                    "backends.targets.weight",
                    format!("must be between 1 and {MAX_TARGET_WEIGHT}"),
                ));
            }
        }
        if self.backends.max_attempts == 0 {
            return Err(ConfigError::invalid("backends.max_attempts", "must be > 0"));
        }
        // Every attempt must be able to time out before the client is
        // answered with a write timeout.
        let retry_budget = self
            .backends
            .attempt_timeout
            .saturating_mul(self.backends.max_attempts);
        if retry_budget >= self.server.write_timeout {
            return Err(ConfigError::invalid(
                "backends.attempt_timeout",
                format!(
                    "{} attempts of {:?} must finish within server.write_timeout ({:?})",
                    self.backends.max_attempts,
                    self.backends.attempt_timeout,
                    self.server.write_timeout
                ),
            ));
        }
        if self.backends.max_buffer_bytes == 0 {
            return Err(ConfigError::invalid(
                "backends.max_buffer_bytes",
                "must be > 0",
            ));
        }
        if let Some(header) = &self.backends.subject_header {
            HeaderName::try_from(header.as_str()).map_err(|_| {
                ConfigError::invalid("backends.subject_header", "not a valid header name")
            })?;
        }
        let health = &self.backends.health_check;
        if health.enabled {
            if !health.path.starts_with('/') {
                return Err(ConfigError::invalid(
                    "backends.health_check.path",
                    "must start with '/'",
                ));
            }
            if health.interval.is_zero() || health.timeout.is_zero() {
                return Err(ConfigError::invalid(
                    "backends.health_check",
                    "interval and timeout must be > 0",
                ));
            }
        }

        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("must be one of {valid_levels:?}"),
            ));
        }
        if self.diagnostics.enabled && self.diagnostics.interval.is_zero() {
            return Err(ConfigError::invalid("diagnostics.interval", "must be > 0"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::from((host, self.server.port))
    }

    /// Applies command line overrides on top of file and environment values.
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if !overrides.targets.is_empty() {
            self.backends.targets = overrides
                .targets
                .iter()
                .map(|url| TargetConfig {
                    url: url.clone(),
                    weight: default_weight(),
                })
                .collect();
        }
        if let Some(url) = &overrides.service_root_url {
            self.service.root_url = url.clone();
        }
        if let Some(path) = &overrides.service_certificate {
            self.service.certificate = Some(path.clone());
        }
        if let Some(path) = &overrides.service_key {
            self.service.key = Some(path.clone());
        }
        if let Some(path) = &overrides.idp_metadata {
            self.service.idp_metadata = Some(path.clone());
        }
        if let Some(path) = &overrides.https_certificate {
            self.tls.certificate = Some(path.clone());
        }
        if let Some(path) = &overrides.https_key {
            self.tls.key = Some(path.clone());
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }
}

fn required<'a>(field: &str, value: &'a Option<PathBuf>) -> Result<&'a Path, ConfigError> {
    value
        .as_deref()
        .ok_or_else(|| ConfigError::invalid(field, "is required"))
}

fn require_file(field: &str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{} is not a readable file", path.display()),
        ))
    }
}

/// Values supplied on the command line. Unset fields leave the loaded
/// configuration untouched.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub targets: Vec<String>,
    pub service_root_url: Option<String>,
    pub service_certificate: Option<PathBuf>,
    pub service_key: Option<PathBuf>,
    pub idp_metadata: Option<PathBuf>,
    pub https_certificate: Option<PathBuf>,
    pub https_key: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Limit for reading request headers and waiting on request body data.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Limit for producing the response head.
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Connections without any I/O for this long are closed.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long in-flight connections may drain on shutdown.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_read_timeout() -> Duration {
    Duration::from_secs(45)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(45)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            idle_timeout: default_idle_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// HTTPS is served when both paths are set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub certificate: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.certificate.is_some() && self.key.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Externally visible root URL of the gateway.
    #[serde(default)]
    pub root_url: String,
    /// SP certificate (PEM).
    #[serde(default)]
    pub certificate: Option<PathBuf>,
    /// SP private key (PEM, PKCS#8 or PKCS#1).
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// IdP metadata XML.
    #[serde(default)]
    pub idp_metadata: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn root_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.root_url)
            .map_err(|e| ConfigError::invalid("service.root_url", e.to_string()))
    }
}

/// Upper bound on a target's weight.
pub const MAX_TARGET_WEIGHT: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl TargetConfig {
    pub fn parsed_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ConfigError::invalid("backends.targets.url", format!("{}: {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
            return Err(ConfigError::invalid(
                "backends.targets.url",
                format!("{} is not an http(s) URL", self.url),
            ));
        }
        Ok(url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    /// Total attempts per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Limit for one attempt to produce response headers.
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Larger request bodies are streamed and never retried.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// Header carrying the authenticated subject to the backends.
    #[serde(default)]
    pub subject_header: Option<String>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_buffer_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            max_attempts: default_max_attempts(),
            attempt_timeout: default_attempt_timeout(),
            max_buffer_bytes: default_max_buffer_bytes(),
            subject_header: None,
            health_check: HealthCheckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_health_path() -> String {
    "/".into()
}
fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_health_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_diagnostics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_diagnostics_interval", with = "humantime_serde")]
    pub interval: Duration,
}
fn default_diagnostics_enabled() -> bool {
    true
}
fn default_diagnostics_interval() -> Duration {
    Duration::from_secs(60)
}
impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: default_diagnostics_enabled(),
            interval: default_diagnostics_interval(),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError, Overrides};
    use config::{Config, Environment, File, FileFormat};
    use std::path::Path;

    /// Default configuration file, used when no path is given.
    pub const DEFAULT_CONFIG_PATH: &str = "samlgate.toml";

    /// Loads the file (if it exists), then `SAMLGATE__SECTION__KEY`
    /// environment overrides, then `overrides`, and validates the result.
    pub fn load_config(
        path: Option<&Path>,
        overrides: &Overrides,
    ) -> Result<AppConfig, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut builder = Config::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        // Environment variable overrides, e.g., SAMLGATE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("SAMLGATE")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Build(e.to_string()))?;
        let mut merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        merged.apply_overrides(overrides);
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config(dir: &Path) -> AppConfig {
        let file = dir.join("material.pem");
        std::fs::write(&file, "x").unwrap();
        let mut cfg = AppConfig::default();
        cfg.service.root_url = "https://gw.example.com".into();
        cfg.service.certificate = Some(file.clone());
        cfg.service.key = Some(file.clone());
        cfg.service.idp_metadata = Some(file);
        cfg.backends.targets = vec![TargetConfig {
            url: "http://127.0.0.1:9000".into(),
            weight: 1,
        }];
        cfg
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(cfg.server.read_timeout, Duration::from_secs(45));
        assert_eq!(cfg.server.write_timeout, Duration::from_secs(45));
        assert_eq!(cfg.server.idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.backends.max_attempts, 3);
        assert_eq!(cfg.backends.attempt_timeout, Duration::from_secs(10));
        assert_eq!(cfg.backends.max_buffer_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(!cfg.tls.is_enabled());
        assert!(!cfg.backends.health_check.enabled);
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        valid_config(dir.path()).validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = valid_config(dir.path());
        cfg.backends.targets.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field, .. }) if field == "backends.targets"));

        let mut cfg = valid_config(dir.path());
        cfg.backends.targets[0].url = "ftp://example.com".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.backends.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.service.root_url = "not a url".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.service.idp_metadata = Some(dir.path().join("missing.xml"));
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.tls.certificate = cfg.service.certificate.clone();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.server.write_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.backends.attempt_timeout = Duration::from_secs(15);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field, .. }) if field == "backends.attempt_timeout"));

        let mut cfg = valid_config(dir.path());
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.backends.subject_header = Some("bad header".into());
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path());
        cfg.saml.path_prefix = "/".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_overrides_replace_targets() {
        let mut cfg = AppConfig::default();
        cfg.backends.targets = vec![TargetConfig {
            url: "http://a:1".into(),
            weight: 5,
        }];
        cfg.apply_overrides(&Overrides {
            targets: vec!["http://b:2".into(), "http://c:3".into()],
            https_key: Some(PathBuf::from("/tmp/key.pem")),
            ..Overrides::default()
        });
        let urls: Vec<_> = cfg.backends.targets.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(urls, ["http://b:2", "http://c:3"]);
        assert!(cfg.backends.targets.iter().all(|t| t.weight == 1));
        assert_eq!(cfg.tls.key, Some(PathBuf::from("/tmp/key.pem")));
        assert!(cfg.service.certificate.is_none());
    }
}
