//! HTTP error responses
//!
//! Every failure leaves the service as JSON `{"error": {"type", "message"}}`
//! with a status code chosen by kind. Pool exhaustion carries `Retry-After`.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Quota(#[from] geonames_quota::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("lease not found or expired: {0}")]
    LeaseNotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use geonames_quota::Error as Q;
        match self {
            ApiError::Quota(Q::PoolExhausted { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Quota(Q::LimiterUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Quota(Q::ProviderAuthFailure { .. } | Q::Upstream(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Quota(Q::NotFound(_)) | ApiError::LeaseNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Quota(Q::Duplicate(_)) => StatusCode::CONFLICT,
            ApiError::Quota(Q::InvalidLimits(_)) | ApiError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        use geonames_quota::Error as Q;
        match self {
            ApiError::Quota(Q::PoolExhausted { .. }) => "pool_exhausted",
            ApiError::Quota(Q::LimiterUnavailable(_)) => "limiter_unavailable",
            ApiError::Quota(Q::ProviderAuthFailure { .. }) => "provider_auth_failure",
            ApiError::Quota(Q::Upstream(_)) => "upstream_error",
            ApiError::Quota(Q::NotFound(_)) => "not_found",
            ApiError::Quota(Q::Duplicate(_)) => "duplicate",
            ApiError::Quota(Q::InvalidLimits(_)) => "invalid_limits",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::LeaseNotFound(_) => "lease_not_found",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Quota(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Whole seconds for a `Retry-After` header, rounded up, at least 1.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_millis().div_ceil(1_000) as u64).max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        let retry_after = self.retry_after().map(retry_after_secs);
        if let Some(secs) = retry_after {
            body["error"]["retry_after_secs"] = secs.into();
        }

        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
