//! Service, add-on and package endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::{AddOnSpec, ServiceSpec};
use crate::model::{AddOn, BookingPackage, Service};

use super::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct PackageRequest {
    pub client_id: Ulid,
    pub name: String,
    #[serde(default)]
    pub service_ids: Vec<Ulid>,
    pub total_sessions: u32,
    #[serde(default)]
    pub validity_days: Option<u32>,
    #[serde(default)]
    pub transferrable: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub sessions: u32,
}

pub async fn register_service(
    State(state): State<AppState>,
    Json(spec): Json<ServiceSpec>,
) -> ApiResult<(StatusCode, Json<Service>)> {
    let service = state.engine.register_service(spec).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

pub async fn register_add_on(
    State(state): State<AppState>,
    Json(spec): Json<AddOnSpec>,
) -> ApiResult<(StatusCode, Json<AddOn>)> {
    let add_on = state.engine.register_add_on(spec).await?;
    Ok((StatusCode::CREATED, Json(add_on)))
}

/// Sell a package; it is purchased now and starts with nothing used.
pub async fn register_package(
    State(state): State<AppState>,
    Json(req): Json<PackageRequest>,
) -> ApiResult<(StatusCode, Json<BookingPackage>)> {
    let package = BookingPackage {
        id: Ulid::new(),
        client_id: req.client_id,
        name: req.name,
        service_ids: req.service_ids,
        total_sessions: req.total_sessions,
        sessions_used: 0,
        sessions_reserved: 0,
        purchased_at: state.engine.now(),
        validity_days: req.validity_days,
        transferrable: req.transferrable,
    };
    let package = state.engine.register_package(package).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

pub async fn get_package(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<BookingPackage>> {
    Ok(Json(state.engine.get_package(id)?))
}

pub async fn consume_package(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(req): Json<ConsumeRequest>,
) -> ApiResult<Json<BookingPackage>> {
    Ok(Json(state.engine.consume_package(id, req.sessions).await?))
}
