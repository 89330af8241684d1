//! # Web API Error Types
//!
//! Error types for the admin API and their HTTP response conversions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::error::ProvisionerError;

/// Admin API errors with HTTP status code mappings
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    NotFound { message: String },

    #[error("Invalid request: {message}")]
    BadRequest { message: String },

    #[error("{message}")]
    Conflict { message: String },

    #[error("{message}")]
    ServiceUnavailable { message: String },

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_code, message) = match &self {
            ApiError::NotFound { message } => (StatusCode::NOT_FOUND, "NOT_FOUND", message.as_str()),

            ApiError::BadRequest { message } => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", message.as_str())
            }

            ApiError::Conflict { message } => (StatusCode::CONFLICT, "CONFLICT", message.as_str()),

            ApiError::ServiceUnavailable { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                message.as_str(),
            ),

            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
            ),
        };

        let error_response = json!({
            "error": {
                "code": error_code,
                "message": message
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

impl From<ProvisionerError> for ApiError {
    fn from(err: ProvisionerError) -> Self {
        let message = err.to_string();
        match err {
            ProvisionerError::TaskNotFound(_) | ProvisionerError::ServerNotFound(_) => {
                ApiError::NotFound { message }
            }
            ProvisionerError::DuplicateActiveTask { .. }
            | ProvisionerError::StaleWrite { .. }
            | ProvisionerError::StateTransitionError(_) => ApiError::Conflict { message },
            ProvisionerError::ValidationError(_) => ApiError::BadRequest { message },
            ProvisionerError::StoreUnavailable(_) | ProvisionerError::NoCapacity => {
                ApiError::ServiceUnavailable { message }
            }
            other => {
                tracing::error!(error = %other, "Admin API request failed");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for web API operations
pub type ApiResult<T> = Result<T, ApiError>;
