//! Service provider protocol and session configuration.
//!
//! These sections are embedded in the server's `AppConfig` and are loaded
//! from the same TOML file and environment overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// NameID format requested when nothing else is configured.
pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";

/// SAML protocol settings.
///
/// # Example (TOML)
///
/// ```toml
/// [saml]
/// path_prefix = "/saml"
/// request_lifetime = "5m"
/// clock_skew = "60s"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SamlConfig {
    /// Path under which the protocol endpoints are mounted.
    /// Requests below this prefix are never gated.
    pub path_prefix: String,

    /// How long an issued AuthnRequest stays acceptable.
    #[serde(with = "humantime_serde")]
    pub request_lifetime: Duration,

    /// Leeway applied to assertion time conditions.
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Sign HTTP-Redirect AuthnRequests with the SP key.
    pub sign_requests: bool,

    /// NameID format requested in the `NameIDPolicy`.
    pub name_id_format: String,

    /// How often expired pending requests are swept.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/saml".to_string(),
            request_lifetime: Duration::from_secs(300),
            clock_skew: Duration::from_secs(60),
            sign_requests: true,
            name_id_format: NAME_ID_FORMAT_TRANSIENT.to_string(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl SamlConfig {
    /// Validates the protocol configuration.
    ///
    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path_prefix.starts_with('/') || self.path_prefix.len() < 2 {
            return Err(ConfigError::invalid_value(
                "saml.path_prefix",
                "must start with '/' and not be the root",
            ));
        }
        if self.path_prefix.ends_with('/') {
            return Err(ConfigError::invalid_value(
                "saml.path_prefix",
                "must not end with '/'",
            ));
        }
        if self.request_lifetime.is_zero() {
            return Err(ConfigError::invalid_value(
                "saml.request_lifetime",
                "must be greater than zero",
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "saml.cleanup_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Session cookie settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the session cookie.
    pub cookie_name: String,

    /// Lifetime of an issued session.
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "saml_session".to_string(),
            lifetime: Duration::from_secs(8 * 3600),
        }
    }
}

impl SessionConfig {
    /// Validates the session configuration.
    ///
    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cookie_name.is_empty()
            || !self
                .cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::invalid_value(
                "session.cookie_name",
                "must be a non-empty token of [A-Za-z0-9_-]",
            ));
        }
        if self.lifetime.is_zero() {
            return Err(ConfigError::invalid_value(
                "session.lifetime",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Dotted path of the setting.
        field: String,
        /// Why the value is invalid.
        message: String,
    },
}

impl ConfigError {
    /// Creates a new `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}
