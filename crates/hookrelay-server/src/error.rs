//! Error handling for the REST API server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookrelay_core::RelayError;
use serde::Serialize;
use std::fmt;

/// API error type.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };

        (self.status, Json(body)).into_response()
    }
}

/// Map a core error onto the status code the ingestion contract promises.
fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::Authentication { .. } => StatusCode::FORBIDDEN,
        RelayError::NotFound { .. } => StatusCode::NOT_FOUND,
        RelayError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RelayError::Inactive { .. } | RelayError::Conflict { .. } => StatusCode::CONFLICT,
        RelayError::Backpressure | RelayError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Configuration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = status_for(&err);
        let code = err.code().as_str();

        // Storage and transport internals stay in the logs.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code, error = %err, "Internal error while handling request");
            return ApiError::new(status, code, "Internal server error");
        }

        let mut api = ApiError::new(status, code, err.to_string());
        if let RelayError::NotFound {
            resource_id: Some(id),
            ..
        } = &err
        {
            api = api.with_details(serde_json::json!({ "resource_id": id }));
        }
        api
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
