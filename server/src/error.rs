//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mend_engine::Error as EngineError;
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Engine(e) => engine_status(e),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

fn engine_status(err: &EngineError) -> (StatusCode, String, Option<String>) {
    match err {
        EngineError::RecordNotFound(_) => (StatusCode::NOT_FOUND, err.to_string(), None),
        EngineError::StaleRevision { .. } | EngineError::RevisionConflict { .. } => {
            tracing::debug!("Revision conflict: {}", err);
            (StatusCode::CONFLICT, err.to_string(), None)
        }
        EngineError::MetadataChangeRejected { .. } | EngineError::InvalidRequest(_) => {
            tracing::warn!("Rejected request: {}", err);
            (StatusCode::BAD_REQUEST, err.to_string(), None)
        }
        EngineError::Serialization(_) => (StatusCode::BAD_REQUEST, err.to_string(), None),
        EngineError::PhaseInconsistency { .. } => {
            tracing::error!("Store left inconsistent: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(err.to_string()),
            )
        }
        EngineError::Store(msg) => {
            tracing::error!("Store error: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Store error".to_string(),
                None,
            )
        }
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
