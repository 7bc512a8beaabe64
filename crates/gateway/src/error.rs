//! Error kinds surfaced on the HTTP surface, mapped to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("missing signature headers")]
    MissingSignature,
    #[error("bad signature")]
    BadSignature,
    #[error("timestamp outside allowed window")]
    TimestampOutsideWindow,
    #[error("replay detected")]
    ReplayDetected,
    #[error("rate limited")]
    RateLimited,
    #[error("global freeze active")]
    GlobalFreeze,
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidApiKey
            | ApiError::MissingSignature
            | ApiError::BadSignature
            | ApiError::TimestampOutsideWindow => StatusCode::UNAUTHORIZED,
            ApiError::ReplayDetected => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::GlobalFreeze => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidApiKey => "invalid_api_key",
            ApiError::MissingSignature => "missing_signature",
            ApiError::BadSignature => "bad_signature",
            ApiError::TimestampOutsideWindow => "timestamp_outside_window",
            ApiError::ReplayDetected => "replay_detected",
            ApiError::RateLimited => "rate_limited",
            ApiError::GlobalFreeze => "global_freeze",
            ApiError::BadInput(_) => "bad_input",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind(),
            "detail": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
