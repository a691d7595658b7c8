//! Upstream forwarding
//!
//! Method, path, query and body go through unchanged. `Host` keeps the
//! client's value and the client address is added as `X-Real-IP` and appended
//! to `X-Forwarded-For`. Hop-by-hop headers are dropped both ways.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};
use http_body_util::LengthLimitError;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, warn};

use crate::error::ApiError;

use super::EdgeState;

/// Headers that describe a single connection, never forwarded
pub const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "te",
    "trailer",
];

pub const X_REAL_IP: &str = "x-real-ip";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop names plus any header the `Connection` header lists
fn connection_scoped(headers: &HeaderMap) -> HashSet<String> {
    let mut names: HashSet<String> = HOP_BY_HOP_HEADERS.iter().map(|h| h.to_string()).collect();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            names.extend(
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .filter(|token| !token.is_empty()),
            );
        }
    }
    names
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let scoped = connection_scoped(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !scoped.contains(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Request headers as sent upstream
pub fn forwarded_headers(incoming: &HeaderMap, client_ip: Option<IpAddr>) -> HeaderMap {
    let mut headers = strip_hop_by_hop(incoming);
    headers.remove(X_REAL_IP);
    headers.remove(X_FORWARDED_PROTO);
    // content-length is recomputed from the buffered body
    headers.remove(header::CONTENT_LENGTH);

    if let Some(ip) = client_ip {
        let ip = ip.to_string();
        let forwarded_for = incoming
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .chain(std::iter::once(ip.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        if let Ok(value) = HeaderValue::from_str(&ip) {
            headers.insert(HeaderName::from_static(X_REAL_IP), value);
        }
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
        }
    }

    headers.insert(
        HeaderName::from_static(X_FORWARDED_PROTO),
        HeaderValue::from_static("http"),
    );
    headers
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Forward `req` to `upstream` (scheme://host:port, no trailing slash)
pub async fn forward(state: &EdgeState, upstream: &str, req: Request) -> Result<Response, ApiError> {
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", upstream, path_and_query);
    let max_body = state.config.max_body_bytes;

    if declared_length(&parts.headers).map_or(false, |len| len > max_body) {
        warn!(url = %url, limit = max_body, "Request body over limit");
        return Err(ApiError::PayloadTooLarge(max_body));
    }

    // chunked bodies carry no Content-Length; the limit trips while reading
    let body = axum::body::to_bytes(body, max_body).await.map_err(|e| {
        if is_length_limit(&e) {
            warn!(url = %url, limit = max_body, "Request body over limit");
            ApiError::PayloadTooLarge(max_body)
        } else {
            error!(error = %e, "Failed to read request body");
            ApiError::bad_request(format!("Failed to read request body: {}", e))
        }
    })?;

    debug!(method = %parts.method, url = %url, client = ?client_ip, "Proxy request");

    let upstream_resp = state
        .client
        .request(parts.method.clone(), &url)
        .headers(forwarded_headers(&parts.headers, client_ip))
        .body(body)
        .send()
        .await
        .map_err(|e| upstream_error(&url, e))?;

    let status = upstream_resp.status();
    let headers = strip_hop_by_hop(upstream_resp.headers());
    let bytes = upstream_resp
        .bytes()
        .await
        .map_err(|e| upstream_error(&url, e))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Timeout → 504, anything else (refused, reset, DNS) → 502
fn upstream_error(url: &str, err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        error!(url = %url, error = %err, "Upstream timed out");
        ApiError::gateway_timeout(format!("Upstream did not answer in time: {}", url))
    } else {
        error!(url = %url, error = %err, "Upstream unreachable");
        ApiError::bad_gateway(format!("Upstream unreachable: {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_headers_keep_host_and_add_client() {
        let incoming = headers(&[("host", "shop.example.com"), ("accept", "application/json")]);
        let out = forwarded_headers(&incoming, Some("203.0.113.7".parse().unwrap()));

        assert_eq!(out["host"], "shop.example.com");
        assert_eq!(out["accept"], "application/json");
        assert_eq!(out[X_REAL_IP], "203.0.113.7");
        assert_eq!(out[X_FORWARDED_FOR], "203.0.113.7");
        assert_eq!(out[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn test_forwarded_for_is_appended() {
        let incoming = headers(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);
        let out = forwarded_headers(&incoming, Some("203.0.113.7".parse().unwrap()));
        assert_eq!(out[X_FORWARDED_FOR], "10.0.0.1, 10.0.0.2, 203.0.113.7");
    }

    #[test]
    fn test_client_supplied_real_ip_is_replaced() {
        let incoming = headers(&[("x-real-ip", "1.2.3.4")]);
        let out = forwarded_headers(&incoming, Some("203.0.113.7".parse().unwrap()));
        assert_eq!(out.get_all(X_REAL_IP).iter().count(), 1);
        assert_eq!(out[X_REAL_IP], "203.0.113.7");
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let incoming = headers(&[
            ("connection", "keep-alive, x-session-hint"),
            ("keep-alive", "timeout=5"),
            ("te", "trailers"),
            ("upgrade", "websocket"),
            ("proxy-connection", "keep-alive"),
            ("x-session-hint", "abc"),
            ("x-request-id", "42"),
        ]);
        let out = forwarded_headers(&incoming, None);

        for name in HOP_BY_HOP_HEADERS {
            assert!(out.get(name).is_none(), "{} leaked", name);
        }
        assert!(out.get("x-session-hint").is_none());
        assert_eq!(out["x-request-id"], "42");
        assert!(out.get(X_REAL_IP).is_none());
    }
}
