//! # samlgate-auth
//!
//! SAML 2.0 service provider support for the SamlGate authenticating proxy.
//!
//! This crate provides:
//! - Trust material loading (IdP metadata, SP key pair)
//! - XML parsing, exclusive canonicalization and enveloped signatures
//! - The SP protocol engine (AuthnRequest issuing, response validation)
//! - A single-use registry of pending authentication requests
//! - Stateless signed session tokens
//! - The request gate middleware and the SAML HTTP endpoints
//!
//! ## Modules
//!
//! - [`config`] - Protocol and session configuration
//! - [`trust`] - Certificates, keys and the trust store
//! - [`metadata`] - IdP metadata parsing and SP metadata rendering
//! - [`xml`] - Minimal namespace-aware DOM, C14N and XML-DSig
//! - [`saml`] - The service provider protocol engine
//! - [`storage`] - Pending authentication request tracking
//! - [`session`] - Session token issuing and validation
//! - [`middleware`] - Request gate
//! - [`http`] - Axum handlers for the SAML endpoints

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metadata;
pub mod middleware;
pub mod saml;
pub mod session;
pub mod storage;
pub mod trust;
pub mod xml;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::{ConfigError, SamlConfig, SessionConfig};
pub use error::{AuthError, ErrorCategory};
pub use http::{SamlState, saml_routes};
pub use middleware::{Admission, AuthenticatedSubject, RequestGate, require_session};
pub use saml::{AuthenticatedLogin, LoginRedirect, ServiceProvider, ServiceUrls};
pub use session::{Session, SessionError, SessionManager};
pub use storage::{InMemoryRequestTracker, PendingRequest, RequestTracker};
pub use trust::{Certificate, IdpDescriptor, ServiceProviderKeys, TrustError, TrustStore};

/// Type alias for authentication results.
pub type AuthResult<T> = Result<T, AuthError>;
