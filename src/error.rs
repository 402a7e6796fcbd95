use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Whether 5xx responses carry the underlying error message.
static EXPOSE_INTERNAL_ERRORS: AtomicBool = AtomicBool::new(true);

/// Toggle verbose error bodies (development) or sanitized ones (production).
pub fn set_expose_internal_errors(expose: bool) {
    EXPOSE_INTERNAL_ERRORS.store(expose, Ordering::Relaxed);
}

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found error.
    #[error("{0}")]
    NotFound(String),

    /// Request failed validation.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("{0}")]
    Forbidden(String),

    /// Uniqueness or state conflict.
    #[error("{0}")]
    Conflict(String),

    /// Upload or body exceeds the configured limit.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JWT encoding error.
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// Image processing error.
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Image(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::Image(_) => "invalid_image",
            AppError::Database(_) => "database_error",
            _ => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (message, detail) = if status.is_server_error() {
            tracing::error!(error = %self, "Request error");
            if EXPOSE_INTERNAL_ERRORS.load(Ordering::Relaxed) {
                (self.to_string(), Some(format!("{:?}", self)))
            } else {
                ("Internal server error".to_string(), None)
            }
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
            (self.to_string(), None)
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message,
                detail,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(err) => {
                AppError::Validation(format!("Invalid request body: {}", err.body_text()))
            }
            JsonRejection::JsonSyntaxError(_) => {
                AppError::Validation("Malformed JSON in request body".to_string())
            }
            JsonRejection::MissingJsonContentType(_) => AppError::Validation(
                "Missing Content-Type: application/json header".to_string(),
            ),
            other => AppError::Validation(other.body_text()),
        }
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(format!("Invalid query parameter: {}", rejection.body_text()))
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(err.body_text())
        } else {
            AppError::Validation(format!("Invalid multipart data: {}", err.body_text()))
        }
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
