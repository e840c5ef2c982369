//! Availability queries and time-boxed holds

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{
    AvailabilityQuery, Booking, PaymentMethod, Reservation, TimeSlotAvailability, TimeSlotRequest,
};

use super::{ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub payment: PaymentMethod,
}

pub async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<Json<TimeSlotAvailability>> {
    Ok(Json(state.engine.availability(&query).await?))
}

pub async fn reserve(
    State(state): State<AppState>,
    Json(req): Json<TimeSlotRequest>,
) -> ApiResult<(StatusCode, Json<Reservation>)> {
    let reservation = state.engine.reserve(req).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Reservation>> {
    Ok(Json(state.engine.get_reservation(id).await?))
}

/// The body is optional; without one the booking is paid at the venue.
pub async fn confirm_reservation(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    body: Option<Json<ConfirmRequest>>,
) -> ApiResult<Json<Booking>> {
    let Json(req) = body.unwrap_or_default();
    Ok(Json(state.engine.confirm_reservation(id, req.payment).await?))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Reservation>> {
    Ok(Json(state.engine.cancel_reservation(id).await?))
}
