//! Header rewriting between client and backend.

use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use tracing::debug;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Checks if a header is a hop-by-hop header that should not be forwarded.
///
/// Hop-by-hop headers are defined in RFC 7230 Section 6.1.
pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::try_from(token.trim()).ok())
        .collect();
    for name in listed {
        debug!(header = %name, "Dropping header listed in Connection");
        headers.remove(&name);
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(&name);
    }
}

/// Where a request came from, for the `X-Forwarded-*` headers.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub addr: Option<IpAddr>,
    pub proto: &'static str,
}

/// Rewrites client headers for the backend.
///
/// `Host` is dropped so the client sets it from the target URL. When
/// `subject_header` is set, any client-supplied copy is replaced by the
/// authenticated subject (or removed if there is none).
pub fn prepare_request_headers(
    headers: &mut HeaderMap,
    client: &ClientInfo,
    subject_header: Option<&HeaderName>,
    subject: Option<&str>,
) {
    strip_hop_by_hop(headers);
    let original_host = headers.remove(header::HOST);

    if let Some(addr) = client.addr {
        let forwarded_for = match headers
            .get(&X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) if !prior.trim().is_empty() => format!("{prior}, {addr}"),
            _ => addr.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if !headers.contains_key(&X_FORWARDED_HOST)
        && let Some(host) = original_host
    {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if !client.proto.is_empty() {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(client.proto));
    }

    if let Some(name) = subject_header {
        headers.remove(name);
        if let Some(value) = subject.and_then(|s| HeaderValue::from_str(s).ok()) {
            headers.insert(name.clone(), value);
        }
    }
}

/// Rewrites backend response headers for the client.
pub fn prepare_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
}
