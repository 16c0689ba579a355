//! Error responses for the SAML endpoints.
//!
//! Protocol failures are logged with their cause by the handlers but answered
//! uniformly, so a client cannot tell a bad signature from a replayed request.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::error::AuthError;

/// Body of every protocol failure response.
pub const AUTHENTICATION_FAILED: &str = "Authentication failed";

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = if self.is_server_error() {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Authentication temporarily unavailable",
            )
        } else {
            (StatusCode::FORBIDDEN, AUTHENTICATION_FAILED)
        };
        (
            status,
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_uniform() {
        let errors = [
            AuthError::signature_invalid("digest mismatch"),
            AuthError::unknown_request("id-1"),
            AuthError::AssertionExpired,
            AuthError::IssuerMismatch {
                issuer: "https://evil.example.com".to_string(),
            },
        ];
        for error in errors {
            let response = error.into_response();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert_eq!(
                response.headers()[header::CACHE_CONTROL],
                "no-store"
            );
        }
    }

    #[test]
    fn test_server_errors_are_500() {
        let response = AuthError::storage("registry unavailable").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
