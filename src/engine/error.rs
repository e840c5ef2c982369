use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingConflict, BookingStatus, ReservationStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("requested interval conflicts: {}", summarize(.0))]
    Conflict(Vec<BookingConflict>),

    #[error("reservation {0} has expired")]
    ReservationExpired(Ulid),

    #[error("reservation {0} is already {1:?}")]
    ReservationClosed(Ulid, ReservationStatus),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Ulid },

    #[error("package {id} has {remaining} session(s) left, {requested} requested")]
    PackageExhausted {
        id: Ulid,
        remaining: u32,
        requested: u32,
    },

    #[error("package {0} has expired")]
    PackageExpired(Ulid),

    #[error("cannot move booking {id} from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("{collaborator} failed: {message}")]
    Downstream {
        collaborator: &'static str,
        message: String,
    },

    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { kind, id }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

fn summarize(conflicts: &[BookingConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.kind.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
