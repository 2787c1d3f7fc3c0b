//! Error taxonomy for the ceremony control plane (spec.md §7).

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("input error: {0}")]
    Input(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("blob store error: {0}")]
    Blob(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl CoordinatorError {
    /// Transient store conflicts are the only class the platform's
    /// handler infrastructure retries (spec.md §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::TransientStore(_))
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            CoordinatorError::Input(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::Auth(_) => StatusCode::UNAUTHORIZED,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            CoordinatorError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoordinatorError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoordinatorError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoordinatorError::Blob(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
