use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Gateway-level errors translated to HTTP at the handler boundary.
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    BadRequest(String),
    /// Unknown model or an empty account pool.
    Unavailable(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            AppError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            AppError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Unauthorized(msg)
            | AppError::BadRequest(msg)
            | AppError::Unavailable(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(status = status.as_u16(), error = %self, "Responding with error");
        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

/// Account login failures, scoped to a single account.
#[derive(Debug)]
pub enum PoolError {
    MissingCredentials,
    MissingToken,
    Http(reqwest::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::MissingCredentials => write!(f, "missing credentials"),
            PoolError::MissingToken => write!(f, "missing token"),
            PoolError::Http(e) => write!(f, "login request failed: {e}"),
        }
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(e: reqwest::Error) -> Self {
        PoolError::Http(e)
    }
}

/// Errors from the DeepSeek upstream calls.
#[derive(Debug)]
pub enum UpstreamError {
    SessionFailed,
    PowFailed,
    /// Non-200 completion response; carries a short body preview.
    Status { status: u16, preview: String },
    Http(reqwest::Error),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::SessionFailed => write!(f, "failed create session"),
            UpstreamError::PowFailed => write!(f, "failed get pow"),
            UpstreamError::Status { status, preview } => {
                write!(f, "upstream status={status} body={preview}")
            }
            UpstreamError::Http(e) => write!(f, "upstream request failed: {e}"),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        UpstreamError::Http(e)
    }
}
