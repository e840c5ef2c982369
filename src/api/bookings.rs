//! Booking endpoints: dry-run validation, creation, recurring series and lifecycle

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::{BookingValidation, SeriesOutcome};
use crate::model::{Actor, Booking, BookingRequest, BookingStatus, Ms};

use super::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct BookingRange {
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: BookingStatus,
    #[serde(default)]
    pub actor: Option<Actor>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub start: Ms,
}

pub async fn validate_booking(
    State(state): State<AppState>,
    Json(req): Json<BookingRequest>,
) -> ApiResult<Json<BookingValidation>> {
    Ok(Json(state.engine.validate_booking(&req).await?))
}

pub async fn create_booking(
    State(state): State<AppState>,
    Json(req): Json<BookingRequest>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let booking = state.engine.create_booking(req).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// 201 when every occurrence was created, 207 when some were rejected.
pub async fn create_series(
    State(state): State<AppState>,
    Json(req): Json<BookingRequest>,
) -> ApiResult<(StatusCode, Json<SeriesOutcome>)> {
    let outcome = state.engine.create_series(req).await?;
    let status = if outcome.is_complete() {
        StatusCode::CREATED
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(outcome)))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(state.engine.get_booking(id).await?))
}

pub async fn list_bookings(
    State(state): State<AppState>,
    Path(provider_id): Path<Ulid>,
    Query(range): Query<BookingRange>,
) -> ApiResult<Json<Vec<Booking>>> {
    if let (Some(from), Some(to)) = (range.from, range.to)
        && to < from
    {
        return Err(ApiError::BadRequest("`to` is before `from`".into()));
    }
    Ok(Json(
        state
            .engine
            .list_bookings(provider_id, range.from, range.to)
            .await?,
    ))
}

/// Defaults to a client-initiated change when no actor is given.
pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(req): Json<StatusUpdate>,
) -> ApiResult<Json<Booking>> {
    let actor = req.actor.unwrap_or(Actor::Client);
    Ok(Json(
        state
            .engine
            .update_status(id, req.status, actor, req.reason)
            .await?,
    ))
}

pub async fn reschedule(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(req): Json<RescheduleRequest>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(state.engine.reschedule(id, req.start).await?))
}
