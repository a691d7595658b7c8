//! Control API authentication
//!
//! Mutating pipeline endpoints take `RequireApiKey`. Operators send the key in
//! `x-api-key`; a GitLab push webhook sends its secret token in
//! `x-gitlab-token`, which is accepted as the same key.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Secret token header of GitLab webhooks
pub const WEBHOOK_TOKEN_HEADER: &str = "x-gitlab-token";

/// Where the caller put its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    ApiKey,
    WebhookToken,
}

/// The request carried the agent's key
///
/// ```ignore
/// async fn approve_run(
///     _auth: RequireApiKey,
///     State(state): State<Arc<AppState>>,
/// ) -> ApiResult<impl IntoResponse> { ... }
/// ```
#[derive(Debug, Clone)]
pub struct RequireApiKey {
    pub source: KeySource,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth = verify_api_key(&parts.headers, &state.api_key)?;
        tracing::debug!(
            method = %parts.method,
            path = %parts.uri.path(),
            source = ?auth.source,
            "Authenticated control request"
        );
        Ok(auth)
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `x-api-key` wins when both headers are present
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    let provided = header_str(headers, API_KEY_HEADER)
        .map(|key| (key, KeySource::ApiKey))
        .or_else(|| header_str(headers, WEBHOOK_TOKEN_HEADER).map(|key| (key, KeySource::WebhookToken)));

    match provided {
        _ if expected_key.is_empty() => {
            tracing::warn!("Agent has an empty API key, refusing control request");
            Err(ApiError::unauthorized())
        }
        Some((key, source)) if key == expected_key => Ok(RequireApiKey { source }),
        Some((_, source)) => {
            tracing::warn!(source = ?source, "Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing x-api-key / x-gitlab-token header");
            Err(ApiError::unauthorized())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_api_key_header() {
        let auth = verify_api_key(&headers(&[(API_KEY_HEADER, "test-key")]), "test-key").unwrap();
        assert_eq!(auth.source, KeySource::ApiKey);
        assert!(verify_api_key(&headers(&[(API_KEY_HEADER, "wrong-key")]), "test-key").is_err());
    }

    #[test]
    fn test_webhook_token_header() {
        let auth = verify_api_key(&headers(&[(WEBHOOK_TOKEN_HEADER, "test-key")]), "test-key").unwrap();
        assert_eq!(auth.source, KeySource::WebhookToken);
    }

    #[test]
    fn test_wrong_api_key_is_not_rescued_by_webhook_token() {
        let both = headers(&[(API_KEY_HEADER, "wrong-key"), (WEBHOOK_TOKEN_HEADER, "test-key")]);
        assert!(verify_api_key(&both, "test-key").is_err());
    }

    #[test]
    fn test_missing_or_unconfigured_key() {
        assert!(verify_api_key(&HeaderMap::new(), "test-key").is_err());
        assert!(verify_api_key(&headers(&[(API_KEY_HEADER, "")]), "").is_err());
    }
}
