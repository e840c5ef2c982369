//! Mapping of engine errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::engine::EngineError;
use crate::model::BookingConflict;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<BookingConflict>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let ApiError::Engine(e) = self else {
            return (StatusCode::BAD_REQUEST, "validation_error");
        };
        match e {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            EngineError::LimitExceeded(_) => (StatusCode::BAD_REQUEST, "limit_exceeded"),
            EngineError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            EngineError::ReservationExpired(_) => (StatusCode::GONE, "reservation_expired"),
            EngineError::ReservationClosed(..) => (StatusCode::CONFLICT, "reservation_closed"),
            EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::PackageExhausted { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "package_exhausted")
            }
            EngineError::PackageExpired(_) => (StatusCode::UNPROCESSABLE_ENTITY, "package_expired"),
            EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            EngineError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
            EngineError::Downstream { .. } => (StatusCode::BAD_GATEWAY, "downstream_error"),
            EngineError::Wal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        let error = self.to_string();
        let conflicts = match self {
            ApiError::Engine(EngineError::Conflict(conflicts)) => conflicts,
            _ => Vec::new(),
        };
        (
            status,
            Json(ErrorResponse {
                code,
                error,
                conflicts,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, ConflictKind, ReservationStatus};
    use ulid::Ulid;

    fn status(e: EngineError) -> StatusCode {
        ApiError::from(e).into_response().status()
    }

    #[test]
    fn engine_errors_map_to_statuses() {
        let id = Ulid::new();
        assert_eq!(status(EngineError::invalid("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(EngineError::LimitExceeded("x")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(EngineError::Conflict(vec![BookingConflict::new(
                ConflictKind::AlreadyBooked,
                "taken"
            )])),
            StatusCode::CONFLICT
        );
        assert_eq!(status(EngineError::ReservationExpired(id)), StatusCode::GONE);
        assert_eq!(
            status(EngineError::ReservationClosed(id, ReservationStatus::Cancelled)),
            StatusCode::CONFLICT
        );
        assert_eq!(status(EngineError::not_found("booking", id)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(EngineError::PackageExhausted {
                id,
                remaining: 0,
                requested: 1
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status(EngineError::InvalidTransition {
                id,
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(EngineError::Downstream {
                collaborator: "payment",
                message: "down".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(EngineError::Wal("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
