//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tillsync_engine::Error as EngineError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(format!("stored JSON is unreadable: {e}"))
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Engine(e) => match e {
                EngineError::SchemaMismatch { .. } => StatusCode::CONFLICT,
                EngineError::ConflictNotFound(_) | EngineError::RecordNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                EngineError::AlreadyResolved(_) | EngineError::NotReviewable(_) => {
                    StatusCode::CONFLICT
                }
                EngineError::CorruptionDetected { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None)
            }
            AppError::Engine(e @ EngineError::SchemaMismatch { local, remote }) => {
                tracing::warn!(device_schema = local, cloud_schema = remote, "schema mismatch");
                (e.to_string(), Some(format!("schema_version={remote}")))
            }
            AppError::Engine(e) if status.is_server_error() => {
                tracing::error!("Engine error: {:?}", e);
                (e.to_string(), None)
            }
            AppError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                (e.to_string(), None)
            }
            AppError::BadRequest(msg) | AppError::NotFound(msg) => (msg.clone(), None),
            AppError::Unauthorized => ("Unauthorized".to_string(), None),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("Internal server error".to_string(), Some(msg.clone()))
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
