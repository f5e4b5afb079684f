//! Error envelope and rate limit headers.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::ratelimit::RateLimitDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The platform's standard error body.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

/// Errors the gate turns into HTTP responses itself.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Too many requests. Please try again later.")]
    RateLimited(RateLimitDecision),

    #[error("Request too large. Maximum size is {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: usize },

    #[error("Upstream service unavailable: {0}")]
    Upstream(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            ApiError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ApiError::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn details(&self) -> Value {
        match self {
            ApiError::RateLimited(decision) => json!({
                "retry_after": decision.retry_after_seconds,
                "reset_time": decision.reset_unix(),
                "limit": decision.limit,
                "classification": decision.classification,
            }),
            ApiError::PayloadTooLarge { limit_bytes } => json!({ "max_bytes": limit_bytes }),
            // Internal details stay in the logs.
            ApiError::Upstream(_) | ApiError::Internal(_) => json!({}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: match &self {
                    ApiError::Upstream(_) => "Service temporarily unavailable".to_string(),
                    _ => self.to_string(),
                },
                details: self.details(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited(decision) = &self {
            apply_rate_limit_headers(response.headers_mut(), decision);
        }
        response
    }
}

/// Attach `X-RateLimit-*` headers, plus `Retry-After` on rejection.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_unix()));

    if decision.allowed {
        headers.remove(RETRY_AFTER);
    } else {
        headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_seconds));
    }
}
