use crate::{
    services::{optimizer::OptimizeError, storage_service::StorageError},
    validation::ValidationError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

const INTERNAL_MESSAGE: &str = "internal server error";

/// A lightweight wrapper for handler errors that keeps the message local.
///
/// Server errors never carry detail to the client; the detail is logged
/// where the error is built.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// 500 with a generic body; `detail` only reaches the log.
    pub fn internal(detail: impl fmt::Display) -> Self {
        tracing::error!(error = %detail, "internal error while serving request");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = if self.status.is_server_error() {
            INTERNAL_MESSAGE.to_string()
        } else {
            self.message
        };
        let body = Json(json!({
            "error": message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Validation(inner) => inner.into(),
            StorageError::NotFound(_) => AppError::not_found(),
            StorageError::CapacityExceeded { .. } => {
                AppError::new(StatusCode::INSUFFICIENT_STORAGE, err.to_string())
            }
            StorageError::Sqlx(inner) => AppError::internal(inner),
        }
    }
}

impl From<OptimizeError> for AppError {
    fn from(err: OptimizeError) -> Self {
        match err {
            OptimizeError::InvalidTarget(_) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            OptimizeError::EncodingFailure(_) | OptimizeError::WorkerUnavailable => {
                AppError::internal(err)
            }
        }
    }
}
