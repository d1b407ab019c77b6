use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use shared::protocol::{ERR_NO_CAPACITY, ERR_REGISTRY_UNAVAILABLE};
use shared::types::ErrorResponse;
use crate::registry::RegistryError;

/// Errors returned by API handlers, each mapped to one status code and a
/// JSON `ErrorResponse` body.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 409: every identifier is already claimed. Expected, not a fault.
    #[error("{0}")]
    NoCapacity(String),

    /// 503: the registry could not answer; the caller may retry.
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoCapacity(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoCapacity(_) => ERR_NO_CAPACITY,
            Self::Unavailable(_) => ERR_REGISTRY_UNAVAILABLE,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        if err.is_retryable() {
            tracing::error!("Registry failure while serving request: {}", err);
            return Self::Unavailable(
                "Activation registry is unavailable, try again later".to_string(),
            );
        }
        Self::NoCapacity("There are not enough devices available".to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
