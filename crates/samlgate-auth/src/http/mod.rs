//! Axum handlers for the SAML service provider endpoints.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET <prefix>/login?return_to=` | [`login_handler`] |
//! | `POST <prefix>/acs` | [`acs_handler`] |
//! | `GET <prefix>/metadata` | [`metadata_handler`] |
//! | `GET <prefix>/logout` | [`logout_handler`] |

use std::sync::Arc;

use axum::{
    Form, Router,
    extract::{Query, State, rejection::FormRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{error, instrument, warn};

use crate::middleware::gate::redirect;
use crate::saml::ServiceProvider;
use crate::session::SessionManager;

/// Media type of SAML metadata documents.
pub const METADATA_CONTENT_TYPE: &str = "application/samlmetadata+xml";

/// State shared by the SAML endpoints.
#[derive(Clone)]
pub struct SamlState {
    /// Protocol engine.
    pub provider: Arc<ServiceProvider>,
    /// Session issuer.
    pub sessions: Arc<SessionManager>,
}

impl SamlState {
    /// Creates the handler state.
    pub fn new(provider: Arc<ServiceProvider>, sessions: Arc<SessionManager>) -> Self {
        Self { provider, sessions }
    }
}

/// Mounts the four endpoints under the configured path prefix.
pub fn saml_routes(state: SamlState) -> Router {
    let prefix = state.provider.config().path_prefix.clone();
    Router::new()
        .route(&format!("{prefix}/login"), get(login_handler))
        .route(&format!("{prefix}/acs"), post(acs_handler))
        .route(&format!("{prefix}/metadata"), get(metadata_handler))
        .route(&format!("{prefix}/logout"), get(logout_handler))
        .with_state(state)
}

/// Query parameters of the login endpoint.
#[derive(Debug, Deserialize)]
pub struct LoginParams {
    /// Local path to continue to after login.
    pub return_to: Option<String>,
}

/// Form posted by the IdP to the assertion consumer service.
#[derive(Debug, Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// Restricts a return target to a same-origin absolute path.
///
/// Anything else (absolute URLs, scheme-relative `//host`, `/\host` which
/// browsers treat alike, control characters) falls back to `/`.
#[must_use]
pub fn sanitize_return_to(target: Option<&str>) -> String {
    match target {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.starts_with("/\\")
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// Starts the login flow by redirecting to the IdP.
#[instrument(skip_all)]
pub async fn login_handler(
    State(state): State<SamlState>,
    Query(params): Query<LoginParams>,
) -> Response {
    let return_path = sanitize_return_to(params.return_to.as_deref());
    match state
        .provider
        .begin_login(&return_path, OffsetDateTime::now_utc())
        .await
    {
        Ok(login) => redirect(login.url.as_str()),
        Err(e) => {
            error!(error = %e, category = %e.category(), "failed to start login");
            e.into_response()
        }
    }
}

/// Consumes the IdP response and establishes the session.
#[instrument(skip_all)]
pub async fn acs_handler(
    State(state): State<SamlState>,
    jar: CookieJar,
    form: Result<Form<AcsForm>, FormRejection>,
) -> Response {
    let now = OffsetDateTime::now_utc();
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            warn!(error = %rejection, "unreadable assertion consumer request");
            return crate::AuthError::malformed("unreadable form body").into_response();
        }
    };
    let Some(encoded) = form.saml_response.filter(|r| !r.is_empty()) else {
        warn!("assertion consumer called without SAMLResponse");
        return crate::AuthError::malformed("missing SAMLResponse").into_response();
    };

    let login = match state
        .provider
        .handle_response(&encoded, form.relay_state.as_deref(), now)
        .await
    {
        Ok(login) => login,
        Err(e) => {
            if e.is_server_error() {
                error!(error = %e, category = %e.category(), "SAML response handling failed");
            } else {
                warn!(error = %e, category = %e.category(), "SAML response rejected");
            }
            return e.into_response();
        }
    };

    match state.sessions.issue(&login.subject, now) {
        Ok(token) => {
            let jar = jar.add(state.sessions.session_cookie(token));
            (jar, redirect(&login.return_path)).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to issue session");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves the service provider metadata.
pub async fn metadata_handler(State(state): State<SamlState>) -> Response {
    (
        [(header::CONTENT_TYPE, METADATA_CONTENT_TYPE)],
        state.provider.metadata(OffsetDateTime::now_utc()),
    )
        .into_response()
}

/// Clears the session cookie. Sessions are stateless, so this is all logout
/// can do.
pub async fn logout_handler(State(state): State<SamlState>, jar: CookieJar) -> Response {
    let jar = jar.add(state.sessions.removal_cookie());
    (jar, redirect("/")).into_response()
}
