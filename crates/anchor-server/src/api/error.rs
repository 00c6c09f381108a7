//! API error type and its JSON rendering.

use anchor_core::db::DatabaseError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::jobs::JobError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No authentication token provided, or authentication was unsuccessful")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_)
            | Self::Database(DatabaseError::NotFound(_))
            | Self::Job(JobError::UnknownJob(_)) => StatusCode::NOT_FOUND,
            Self::Database(_) | Self::Job(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({"message": self.to_string()}))).into_response()
    }
}
