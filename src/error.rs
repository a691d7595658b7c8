//! Error types
//!
//! `ApiError` is the HTTP boundary type shared by the router, the backend and
//! the pipeline agent; it renders as a JSON `ErrorResponse`. `PipelineError`
//! covers release pipeline operations and maps onto `ApiError`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::pipeline::{PipelineState, TransitionError};

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// HTTP-facing error
#[derive(Debug)]
pub enum ApiError {
    /// 401 - missing or invalid API key
    Unauthorized,
    /// 404
    NotFound(String),
    /// 400
    BadRequest(String),
    /// 409 - e.g. approving a run that is not waiting
    Conflict(String),
    /// 413 - proxied body over the limit
    PayloadTooLarge(usize),
    /// 500
    Internal(String),
    /// 502 - upstream unreachable or broken response
    BadGateway(String),
    /// 503
    ServiceUnavailable(String),
    /// 504 - upstream exceeded the bounded timeout
    GatewayTimeout(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::BadGateway(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::GatewayTimeout(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_type, message) = match self {
            ApiError::Unauthorized => ("unauthorized", "Invalid or missing API key".to_string()),
            ApiError::NotFound(resource) => ("not_found", format!("{} not found", resource)),
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::PayloadTooLarge(limit) => (
                "payload_too_large",
                format!("Request body exceeds {} bytes", limit),
            ),
            ApiError::Internal(msg) => ("internal_error", msg),
            ApiError::BadGateway(msg) => ("bad_gateway", msg),
            ApiError::ServiceUnavailable(msg) => ("service_unavailable", msg),
            ApiError::GatewayTimeout(msg) => ("gateway_timeout", msg),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::PayloadTooLarge(n) => write!(f, "Payload larger than {} bytes", n),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::BadGateway(m) => write!(f, "Bad gateway: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
            ApiError::GatewayTimeout(m) => write!(f, "Gateway timeout: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

pub type ApiResult<T> = Result<T, ApiError>;

/// Release pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("branch '{branch}' does not trigger releases (only '{main_branch}')")]
    BranchNotEligible { branch: String, main_branch: String },

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("run '{run_id}' is {state:?}, not awaiting approval")]
    NotAwaitingApproval { run_id: String, state: PipelineState },

    #[error("run '{0}' is rolling out and cannot be interrupted")]
    RolloutInProgress(String),

    #[error("run '{0}' already finished")]
    AlreadyFinished(String),

    #[error("too many active runs (max {0})")]
    AtCapacity(usize),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Descriptor(#[from] crate::config::DescriptorError),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::BranchNotEligible { .. } => ApiError::bad_request(err.to_string()),
            PipelineError::RunNotFound(id) => ApiError::not_found(format!("Run '{}'", id)),
            PipelineError::NotAwaitingApproval { .. }
            | PipelineError::RolloutInProgress(_)
            | PipelineError::AlreadyFinished(_)
            | PipelineError::Transition(_) => ApiError::conflict(err.to_string()),
            PipelineError::AtCapacity(_) => ApiError::service_unavailable(err.to_string()),
            PipelineError::Descriptor(_) => ApiError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_with_details() {
        let resp = ErrorResponse::new("bad_gateway", "upstream down").with_details("connection refused");
        assert_eq!(resp.error, "bad_gateway");
        assert_eq!(resp.details.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_gateway_statuses() {
        assert_eq!(ApiError::bad_gateway("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::gateway_timeout("x").status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::PayloadTooLarge(1).status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_pipeline_error_mapping() {
        let err: ApiError = PipelineError::BranchNotEligible {
            branch: "dev".to_string(),
            main_branch: "main".to_string(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = PipelineError::RunNotFound("r1".to_string()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: ApiError = PipelineError::RolloutInProgress("r1".to_string()).into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
