//! HTTP API error types.
//!
//! Provides a unified `ApiError` enum for consistent error responses across
//! the HTTP API layer. Implements Axum's `IntoResponse` trait to convert
//! errors into the right status codes and JSON bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sy_hitl::HitlError;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur in the HTTP API layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was malformed or invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An internal server error occurred.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<HitlError> for ApiError {
    fn from(err: HitlError) -> Self {
        match err {
            HitlError::NotFound(id) => ApiError::NotFound(format!("review request {id}")),
            HitlError::MissingModifiedAction => ApiError::BadRequest(err.to_string()),
            HitlError::Store(_) | HitlError::Broker(_) => ApiError::InternalError(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
