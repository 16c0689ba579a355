//! Retrying forward proxy.
//!
//! Request bodies up to `max_buffer_bytes` are buffered so that a failed
//! attempt can be replayed against another backend. Larger bodies are
//! streamed and get exactly one attempt. Only attempts that produced no
//! response are retried; any response, whatever its status, is returned
//! to the client as is.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderName, Request, Uri},
    response::Response,
};
use bytes::BytesMut;
use futures_util::StreamExt;
use tracing::{debug, instrument, warn};
use url::Url;

use super::error::GatewayError;
use super::headers::{ClientInfo, prepare_request_headers, prepare_response_headers};
use super::pool::BackendPool;
use super::stats::GatewayStats;
use super::transport::{Outcome, Transport, UpstreamBody, UpstreamRequest, UpstreamResponse};

/// Retry and buffering limits.
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub max_buffer_bytes: usize,
    pub subject_header: Option<HeaderName>,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            max_buffer_bytes: 4 * 1024 * 1024,
            subject_header: None,
        }
    }
}

/// Forwards requests to the pool.
pub struct Forwarder {
    pool: Arc<BackendPool>,
    transport: Arc<dyn Transport>,
    stats: Arc<GatewayStats>,
    settings: ForwardSettings,
}

impl Forwarder {
    pub fn new(
        pool: Arc<BackendPool>,
        transport: Arc<dyn Transport>,
        stats: Arc<GatewayStats>,
        settings: ForwardSettings,
    ) -> Self {
        Self {
            pool,
            transport,
            stats,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    /// Forwards `request`, retrying on other backends while attempts fail
    /// without a response.
    ///
    /// Dropping the returned future aborts the current attempt and any
    /// further retries.
    #[instrument(skip_all, fields(http.method = %request.method(), http.target = %request.uri().path()))]
    pub async fn forward(
        &self,
        request: Request<Body>,
        client: &ClientInfo,
        subject: Option<&str>,
    ) -> Result<Response, GatewayError> {
        let _in_flight = self.stats.begin_request();
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        prepare_request_headers(
            &mut headers,
            client,
            self.settings.subject_header.as_ref(),
            subject,
        );

        let mut body = Some(buffer_body(body, self.settings.max_buffer_bytes).await?);
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < self.settings.max_attempts {
            let Some(attempt_body) = next_attempt_body(&mut body) else {
                debug!("streamed body already consumed, not retrying");
                break;
            };
            let backend = self.pool.next()?;
            attempts += 1;
            self.stats.record_attempt(attempts > 1);

            let upstream = UpstreamRequest {
                method: parts.method.clone(),
                url: target_url(backend.url(), &parts.uri),
                headers: headers.clone(),
                body: attempt_body,
            };
            match self
                .transport
                .send(upstream, self.settings.attempt_timeout)
                .await
            {
                Outcome::Success(response) => {
                    debug!(target_url = %backend.url(), status = %response.status, attempts, "upstream responded");
                    return Ok(client_response(response));
                }
                Outcome::ApplicationError(response) => {
                    debug!(target_url = %backend.url(), status = %response.status, attempts, "upstream returned error status");
                    return Ok(client_response(response));
                }
                Outcome::NetworkError(e) => {
                    warn!(target_url = %backend.url(), attempt = attempts, error = %e, "upstream attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        self.stats.record_upstream_failure();
        Err(GatewayError::UpstreamUnavailable {
            attempts,
            last_error,
        })
    }
}

/// Reads the body up to `limit` bytes. Past the limit the bytes read so far
/// are chained in front of the unread remainder and sent as a stream.
async fn buffer_body(body: Body, limit: usize) -> Result<UpstreamBody, GatewayError> {
    let mut stream = body.into_data_stream();
    let mut buffered = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GatewayError::RequestBody(e.to_string()))?;
        if buffered.len() + chunk.len() > limit {
            let head = futures_util::stream::iter([Ok(buffered.freeze()), Ok(chunk)]);
            return Ok(UpstreamBody::Streaming(Body::from_stream(head.chain(stream))));
        }
        buffered.extend_from_slice(&chunk);
    }
    Ok(UpstreamBody::Buffered(buffered.freeze()))
}

/// Body for the next attempt. Buffered bodies are replayed, streamed ones
/// are handed out once.
fn next_attempt_body(slot: &mut Option<UpstreamBody>) -> Option<UpstreamBody> {
    match slot.take()? {
        UpstreamBody::Buffered(bytes) => {
            *slot = Some(UpstreamBody::Buffered(bytes.clone()));
            Some(UpstreamBody::Buffered(bytes))
        }
        streaming @ UpstreamBody::Streaming(_) => Some(streaming),
    }
}

/// Backend scheme and authority with the client's path and query, appended
/// to any base path the backend URL carries.
pub fn target_url(base: &Url, uri: &Uri) -> Url {
    let mut url = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), uri.path());
    url.set_path(&path);
    url.set_query(uri.query());
    url
}

fn client_response(upstream: UpstreamResponse) -> Response {
    let mut headers = upstream.headers;
    prepare_response_headers(&mut headers);
    let mut response = Response::new(upstream.body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::transport::{NetworkError, UpstreamResponse};
    use async_trait::async_trait;
    use axum::http::{HeaderMap, StatusCode};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Answers per host: refused hosts fail, others return their status.
    /// The first `fail_first` calls time out whatever the host.
    #[derive(Default)]
    struct ScriptedTransport {
        refused: Vec<&'static str>,
        fail_first: usize,
        statuses: HashMap<&'static str, u16>,
        calls: Mutex<Vec<(String, Bytes)>>,
    }

    impl ScriptedTransport {
        fn refusing(hosts: &[&'static str]) -> Self {
            Self {
                refused: hosts.to_vec(),
                ..Self::default()
            }
        }

        fn hosts(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(h, _)| h.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: UpstreamRequest, _timeout: Duration) -> Outcome {
            let host = request.url.host_str().unwrap_or_default().to_string();
            let body = match request.body {
                UpstreamBody::Buffered(bytes) => bytes,
                UpstreamBody::Streaming(body) => axum::body::to_bytes(body, usize::MAX)
                    .await
                    .unwrap_or_default(),
            };
            let call = {
                let mut calls = self.calls.lock();
                calls.push((host.clone(), body));
                calls.len()
            };

            if call <= self.fail_first {
                return Outcome::NetworkError(NetworkError::Timeout(Duration::from_secs(1)));
            }
            if self.refused.contains(&host.as_str()) {
                return Outcome::NetworkError(NetworkError::Connect("connection refused".into()));
            }
            let status = self.statuses.get(host.as_str()).copied().unwrap_or(200);
            Outcome::from_response(UpstreamResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                body: Body::from(format!("from {host}")),
            })
        }
    }

    fn forwarder(hosts: &[&str], transport: Arc<ScriptedTransport>) -> Forwarder {
        forwarder_with(hosts, transport, ForwardSettings::default())
    }

    fn forwarder_with(
        hosts: &[&str],
        transport: Arc<ScriptedTransport>,
        settings: ForwardSettings,
    ) -> Forwarder {
        let pool = Arc::new(BackendPool::new());
        for host in hosts {
            pool.add_target(Url::parse(&format!("http://{host}:8000")).unwrap(), 1);
        }
        Forwarder::new(pool, transport, Arc::new(GatewayStats::new()), settings)
    }

    fn post(body: &'static str) -> Request<Body> {
        Request::post("/submit?x=1").body(Body::from(body)).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_retries_next_backend_after_network_error() {
        let transport = Arc::new(ScriptedTransport::refusing(&["a"]));
        let forwarder = forwarder(&["a", "b"], transport.clone());

        let response = forwarder
            .forward(post("payload"), &ClientInfo::default(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "from b");

        let calls = transport.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        // The buffered body is replayed unchanged.
        assert!(calls.iter().all(|(_, body)| &body[..] == b"payload"));

        let stats = forwarder.stats().snapshot();
        assert_eq!((stats.requests, stats.attempts, stats.retries), (1, 2, 1));
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_third_attempt_receives_original_body() {
        let transport = Arc::new(ScriptedTransport {
            fail_first: 2,
            ..ScriptedTransport::default()
        });
        let forwarder = forwarder(&["a", "b", "c"], transport.clone());
        let payload: &'static [u8] = b"{\"order\":42}\r\n\x00\xff tail";

        let request = Request::put("/orders/42")
            .body(Body::from(payload))
            .unwrap();
        let response = forwarder
            .forward(request, &ClientInfo::default(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "from c");

        let calls = transport.calls.lock().clone();
        let hosts: Vec<_> = calls.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(hosts, ["a", "b", "c"]);
        for (_, body) in &calls {
            assert_eq!(&body[..], payload);
        }

        let stats = forwarder.stats().snapshot();
        assert_eq!((stats.attempts, stats.retries, stats.upstream_failures), (3, 2, 0));
    }

    #[tokio::test]
    async fn test_error_status_is_not_retried() {
        let transport = Arc::new(ScriptedTransport {
            statuses: HashMap::from([("a", 500), ("b", 404)]),
            ..ScriptedTransport::default()
        });
        let forwarder = forwarder(&["a", "b"], transport.clone());

        let response = forwarder
            .forward(post(""), &ClientInfo::default(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(transport.hosts(), ["a"]);
    }

    #[tokio::test]
    async fn test_exhaustion_is_upstream_unavailable() {
        let transport = Arc::new(ScriptedTransport::refusing(&["a", "b"]));
        let forwarder = forwarder(&["a", "b"], transport.clone());

        let err = forwarder
            .forward(post(""), &ClientInfo::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UpstreamUnavailable { attempts: 3, .. }
        ));
        assert_eq!(transport.hosts(), ["a", "b", "a"]);
        assert_eq!(forwarder.stats().snapshot().upstream_failures, 1);
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_live_backends() {
        let transport = Arc::new(ScriptedTransport::default());
        let forwarder = forwarder(&[], transport.clone());

        let err = forwarder
            .forward(post(""), &ClientInfo::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoLiveBackends));
        assert!(transport.hosts().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_is_streamed_once() {
        let settings = ForwardSettings {
            max_buffer_bytes: 4,
            ..ForwardSettings::default()
        };

        let transport = Arc::new(ScriptedTransport::refusing(&["a"]));
        let forwarder = forwarder_with(&["a", "b"], transport.clone(), settings.clone());
        let err = forwarder
            .forward(post("hello world"), &ClientInfo::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UpstreamUnavailable { attempts: 1, .. }
        ));

        let transport = Arc::new(ScriptedTransport::default());
        let forwarder = forwarder_with(&["b"], transport.clone(), settings);
        forwarder
            .forward(post("hello world"), &ClientInfo::default(), None)
            .await
            .unwrap();
        let calls = transport.calls.lock().clone();
        assert_eq!(&calls[0].1[..], b"hello world");
    }

    #[test]
    fn test_target_url() {
        let uri: Uri = "/app/page?q=1".parse().unwrap();
        let plain = Url::parse("http://10.0.0.1:8000").unwrap();
        assert_eq!(
            target_url(&plain, &uri).as_str(),
            "http://10.0.0.1:8000/app/page?q=1"
        );
        let based = Url::parse("http://10.0.0.1:8000/base/").unwrap();
        assert_eq!(
            target_url(&based, &uri).as_str(),
            "http://10.0.0.1:8000/base/app/page?q=1"
        );
        let bare: Uri = "/".parse().unwrap();
        assert_eq!(target_url(&plain, &bare).as_str(), "http://10.0.0.1:8000/");
    }
}
