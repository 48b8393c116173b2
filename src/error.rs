use crate::auth::{AuthError, VerifyError};
use crate::config::ConfigError;
use crate::transcription::TranscriptionError;
use crate::validate::ValidationError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

/// Error reported to the caller before any response header is committed.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code,
            details: self.details,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Missing => AppError::new(
                StatusCode::UNAUTHORIZED,
                "token_missing",
                "Authentication token required.",
            ),
            AuthError::Invalid(_) => AppError::new(
                StatusCode::FORBIDDEN,
                "token_invalid",
                "Invalid or expired token.",
            ),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(_: ConfigError) -> Self {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_misconfigured",
            "Server configuration error.",
        )
    }
}

impl From<VerifyError> for AppError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Auth(err) => err.into(),
            VerifyError::Config(err) => err.into(),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        let details = serde_json::to_value(&err.details).unwrap_or(Value::Null);
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Invalid request payload.",
        )
        .with_details(details)
    }
}

impl From<TranscriptionError> for AppError {
    fn from(err: TranscriptionError) -> Self {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "transcription_failed",
            "Audio transcription failed",
        )
        .with_details(Value::String(err.cause))
    }
}
