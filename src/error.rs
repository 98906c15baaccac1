//! The error taxonomy. Every fallible operation in this crate returns
//! `Result<T, AppError>` (aliased as [`AppResult`]); higher layers convert
//! from `sqlx::Error`/`reqwest::Error`/`serde_json::Error` into the
//! appropriate taxonomy member rather than leaking transport errors upward.

use axum::{Json, http::StatusCode, response::IntoResponse, response::Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Fatal at startup; a 500 if somehow surfaced at request time.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Network/rate-limit/timeout. Retried inside `generate`/`embed`; any
    /// other call site surfaces this as-is (503 + retry hint at the HTTP edge).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed LLM JSON. Recovered locally wherever the spec calls for it
    /// (consensus reviews, orchestrator retries); only surfaces if recovery
    /// itself is exhausted.
    #[error("parse error: {0}")]
    Parse(String),

    /// The response guard blocked an output. Carries the safe sentence that
    /// should be returned in its place.
    #[error("guard blocked: {0}")]
    GuardBlocked(String),

    /// A cancellation signal fired. No body, no retry.
    #[error("cancelled")]
    Cancelled,

    /// An invariant was violated. Always logged, never swallowed.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(error = %msg, "internal invariant violation");
        AppError::Internal(msg)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => AppError::NotFound(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => AppError::Transient(e.to_string()),
            _ => AppError::internal(format!("database error: {e}")),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return AppError::Transient(e.to_string());
        }
        if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return AppError::Transient(e.to_string());
            }
            return AppError::Parse(format!("provider rejected request: {e}"));
        }
        AppError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Parse(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, retry) = match &self {
            AppError::Config(_) | AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, false),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, false),
            AppError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, true),
            AppError::Parse(_) => (StatusCode::UNPROCESSABLE_ENTITY, false),
            AppError::GuardBlocked(_) => (StatusCode::OK, false),
            AppError::Cancelled => (StatusCode::from_u16(499).unwrap(), false),
        };
        let body = json!({
            "error": true,
            "message": self.to_string(),
            "retry": retry,
        });
        (status, Json(body)).into_response()
    }
}
