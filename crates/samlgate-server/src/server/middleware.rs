use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

// Request ID middleware: keeps an incoming X-Request-Id or generates one, so the
// backends and the client see the same ID as the logs.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let req_id_value = req
        .headers()
        .get(&X_REQUEST_ID)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };
    req.headers_mut()
        .insert(X_REQUEST_ID, req_id_value.clone());
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(X_REQUEST_ID, req_id_value);
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/",
                get(|req: Request<Body>| async move {
                    req.headers()
                        .get(&X_REQUEST_ID)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
            )
            .layer(axum::middleware::from_fn(request_id))
    }

    #[tokio::test]
    async fn test_generates_and_echoes_id() {
        let response = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let header = response.headers()[&X_REQUEST_ID].to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&header).is_ok());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, header.as_bytes());
    }

    #[tokio::test]
    async fn test_preserves_incoming_id() {
        let response = app()
            .oneshot(
                Request::get("/")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[&X_REQUEST_ID], "abc-123");
    }
}
