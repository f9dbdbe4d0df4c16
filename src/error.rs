//! Engine and HTTP error types.

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{dao::storage::StorageError, state::lifecycle::TransitionError};

/// Errors surfaced by the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Session or player does not exist in either store.
    #[error("not found: {0}")]
    NotFound(String),
    /// Requested status change is not allowed from the current status.
    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),
    /// Both stores (or the only relevant store) failed.
    #[error("store unavailable")]
    StoreUnavailable(#[source] StorageError),
    /// The store asked us to slow down.
    #[error("store rate limited")]
    RateLimited(#[source] StorageError),
    /// Request rejected before reaching any store.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl SyncError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_) | SyncError::RateLimited(_)
        )
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        if err.is_rate_limited() {
            SyncError::RateLimited(err)
        } else {
            SyncError::StoreUnavailable(err)
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(message) => AppError::NotFound(message),
            SyncError::InvalidTransition(invalid) => AppError::Conflict(invalid.to_string()),
            SyncError::InvalidInput(message) => AppError::BadRequest(message),
            SyncError::StoreUnavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            SyncError::RateLimited(source) => AppError::ServiceUnavailable(source.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::SessionStatus;

    #[test]
    fn storage_errors_keep_their_flavour() {
        let limited: SyncError = StorageError::rate_limited("slow down").into();
        assert!(matches!(limited, SyncError::RateLimited(_)));
        assert!(limited.is_retryable());

        let invalid = SyncError::InvalidInput("empty name".into());
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn sync_errors_map_to_http_statuses() {
        let cases = [
            (SyncError::NotFound("123456".into()), StatusCode::NOT_FOUND),
            (
                SyncError::InvalidTransition(TransitionError::Backward {
                    from: SessionStatus::Active,
                    to: SessionStatus::Waiting,
                }),
                StatusCode::CONFLICT,
            ),
            (SyncError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                SyncError::RateLimited(StorageError::rate_limited("busy")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, expected) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
