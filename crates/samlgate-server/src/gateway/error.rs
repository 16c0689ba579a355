//! Gateway-specific error types.

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// Errors produced while forwarding a request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The pool has no healthy backend.
    #[error("No live backends")]
    NoLiveBackends,

    /// Every attempt failed before a response arrived.
    #[error("Upstream unavailable after {attempts} attempt(s): {last_error}")]
    UpstreamUnavailable { attempts: u32, last_error: String },

    /// The client request body could not be read.
    #[error("Failed to read request body: {0}")]
    RequestBody(String),
}

impl GatewayError {
    /// HTTP status the client sees.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoLiveBackends => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Upstream details stay in the logs.
        let body = status.canonical_reason().unwrap_or("Error");
        (
            status,
            [
                (
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                ),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
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
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::NoLiveBackends.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let exhausted = GatewayError::UpstreamUnavailable {
            attempts: 3,
            last_error: "connection refused".into(),
        };
        assert_eq!(exhausted.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::RequestBody("reset".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_response_hides_details() {
        let response = GatewayError::UpstreamUnavailable {
            attempts: 3,
            last_error: "10.0.0.7:8000 refused".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Bad Gateway");
    }
}
