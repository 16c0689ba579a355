//! Session gate in front of the proxied application.
//!
//! Requests under the protocol prefix pass through untouched. Every other
//! request must carry a valid session cookie; on success the subject is
//! attached to the request extensions, otherwise the browser is redirected to
//! the login endpoint with the original target as `return_to`. All session
//! failures produce the same redirect.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use time::OffsetDateTime;
use tracing::debug;
use url::Url;

use crate::saml::ServiceUrls;
use crate::session::{Session, SessionManager};

/// Outcome of gating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Protocol endpoint; no session required.
    Bypass,
    /// Valid session.
    Forward(Session),
    /// No valid session; redirect the browser here.
    Redirect(String),
}

/// Subject of the session that admitted the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

impl<S> FromRequestParts<S> for AuthenticatedSubject
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedSubject>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Decides whether requests may reach the backends.
pub struct RequestGate {
    sessions: Arc<SessionManager>,
    prefix: String,
    login_url: Url,
}

impl RequestGate {
    /// Creates a gate bypassing `path_prefix` and redirecting to the login
    /// endpoint of `urls`.
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>, urls: &ServiceUrls, path_prefix: &str) -> Self {
        Self {
            sessions,
            prefix: path_prefix.trim_end_matches('/').to_string(),
            login_url: urls.login.clone(),
        }
    }

    /// Gates a request.
    #[must_use]
    pub fn admit(&self, uri: &Uri, headers: &HeaderMap, now: OffsetDateTime) -> Admission {
        if self.is_protocol_path(uri.path()) {
            return Admission::Bypass;
        }

        let session = self
            .sessions
            .token_from_headers(headers)
            .and_then(|token| self.sessions.validate(&token, now).ok());
        match session {
            Some(session) => Admission::Forward(session),
            None => Admission::Redirect(self.login_location(uri)),
        }
    }

    fn is_protocol_path(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    fn login_location(&self, uri: &Uri) -> String {
        let return_to = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
        let mut location = self.login_url.clone();
        location
            .query_pairs_mut()
            .append_pair("return_to", &return_to);
        location.into()
    }
}

/// Middleware applying a [`RequestGate`].
///
/// Use with `axum::middleware::from_fn_with_state`.
pub async fn require_session(
    State(gate): State<Arc<RequestGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    match gate.admit(request.uri(), request.headers(), OffsetDateTime::now_utc()) {
        Admission::Bypass => next.run(request).await,
        Admission::Forward(session) => {
            request
                .extensions_mut()
                .insert(AuthenticatedSubject(session.subject));
            next.run(request).await
        }
        Admission::Redirect(location) => {
            debug!(path = %request.uri().path(), "no valid session, redirecting to login");
            redirect(&location)
        }
    }
}

/// A `302 Found` to `location`.
pub(crate) fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (
            StatusCode::FOUND,
            [
                (header::LOCATION, value),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            ],
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
