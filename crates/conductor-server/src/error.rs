//! Error types for the Conductor HTTP surface.
//!
//! [`ApiError`] maps state-manager failures onto HTTP statuses and renders
//! them as `{error, status}` JSON via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use conductor_core::CoreError;

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The operation was rejected by the state manager.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    /// The HTTP status this error maps to.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Core(CoreError::InvalidModule(_)) => StatusCode::NOT_FOUND,
            Self::Core(CoreError::OutOfRange { .. } | CoreError::MalformedEnvelope(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Core(CoreError::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
