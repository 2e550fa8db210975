//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use husk_core::{CoreError, ErrorKind};
use husk_executor::ExecutorError;
use serde_json::json;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the executor layer.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The request body is malformed in a way no validator covers.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<CoreError> for GatewayError {
    fn from(e: CoreError) -> Self {
        Self::Executor(ExecutorError::Validation(e))
    }
}

impl GatewayError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        let GatewayError::Executor(e) = self else {
            return StatusCode::BAD_REQUEST;
        };
        if e.is_not_found() {
            return StatusCode::NOT_FOUND;
        }
        match e.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Lifecycle => StatusCode::CONFLICT,
            ErrorKind::ResourceExhaustion => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = match &self {
            GatewayError::Executor(e) => json!(e.report()),
            GatewayError::InvalidRequest(message) => json!({
                "code": "ERR_INVALID_REQUEST",
                "kind": ErrorKind::Validation,
                "message": message,
            }),
        };
        (status, Json(body)).into_response()
    }
}
