//! Provider, availability rule, override and calendar event endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::{CalendarEventSpec, EngineError, OverrideSpec, ProviderSpec, RuleSpec};
use crate::model::{AvailabilityOverride, AvailabilityRule, CalendarEvent, ProviderInfo};

use super::{ApiResult, AppState};

/// Nested routes address entities by provider too; an id owned by another
/// provider reads as missing.
fn owned_by(state: &AppState, kind: &'static str, provider_id: Ulid, id: Ulid) -> ApiResult<()> {
    match state.engine.get_provider_for_entity(&id) {
        Some(owner) if owner == provider_id => Ok(()),
        _ => Err(EngineError::NotFound { kind, id }.into()),
    }
}

pub async fn create_provider(
    State(state): State<AppState>,
    Json(spec): Json<ProviderSpec>,
) -> ApiResult<(StatusCode, Json<ProviderInfo>)> {
    let provider = state.engine.create_provider(spec).await?;
    Ok((StatusCode::CREATED, Json(provider)))
}

pub async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<ProviderInfo>> {
    Ok(Json(state.engine.provider_info(id).await?))
}

pub async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(spec): Json<ProviderSpec>,
) -> ApiResult<Json<ProviderInfo>> {
    Ok(Json(state.engine.update_provider(id, spec).await?))
}

pub async fn add_rule(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(spec): Json<RuleSpec>,
) -> ApiResult<(StatusCode, Json<AvailabilityRule>)> {
    let rule = state.engine.add_rule(id, spec).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn remove_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(Ulid, Ulid)>,
) -> ApiResult<StatusCode> {
    owned_by(&state, "rule", id, rule_id)?;
    state.engine.remove_rule(rule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_override(
    State(state): State<AppState>,
    Path((id, date)): Path<(Ulid, NaiveDate)>,
    Json(spec): Json<OverrideSpec>,
) -> ApiResult<Json<AvailabilityOverride>> {
    Ok(Json(state.engine.set_override(id, date, spec).await?))
}

pub async fn clear_override(
    State(state): State<AppState>,
    Path((id, date)): Path<(Ulid, NaiveDate)>,
) -> ApiResult<StatusCode> {
    if state.engine.clear_override(id, date).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

pub async fn add_event(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(spec): Json<CalendarEventSpec>,
) -> ApiResult<(StatusCode, Json<CalendarEvent>)> {
    let event = state.engine.add_calendar_event(id, spec).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

pub async fn remove_event(
    State(state): State<AppState>,
    Path((id, event_id)): Path<(Ulid, Ulid)>,
) -> ApiResult<StatusCode> {
    owned_by(&state, "calendar event", id, event_id)?;
    state.engine.remove_calendar_event(event_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
