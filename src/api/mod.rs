//! HTTP surface over the engine

pub mod bookings;
pub mod catalog;
pub mod error;
pub mod providers;
pub mod reservations;

use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::engine::Engine;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub providers: usize,
}

pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        providers: state.engine.provider_count(),
    })
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/health", get(health_check))
        // Providers and their calendars
        .route("/providers", post(providers::create_provider))
        .route(
            "/providers/:id",
            get(providers::get_provider).put(providers::update_provider),
        )
        .route("/providers/:id/rules", post(providers::add_rule))
        .route("/providers/:id/rules/:rule_id", delete(providers::remove_rule))
        .route(
            "/providers/:id/overrides/:date",
            put(providers::set_override).delete(providers::clear_override),
        )
        .route("/providers/:id/events", post(providers::add_event))
        .route("/providers/:id/events/:event_id", delete(providers::remove_event))
        .route("/providers/:id/bookings", get(bookings::list_bookings))
        // Catalog
        .route("/services", post(catalog::register_service))
        .route("/add-ons", post(catalog::register_add_on))
        .route("/packages", post(catalog::register_package))
        .route("/packages/:id", get(catalog::get_package))
        .route("/packages/:id/consume", post(catalog::consume_package))
        // Availability and holds
        .route("/availability", get(reservations::availability))
        .route("/reservations", post(reservations::reserve))
        .route(
            "/reservations/:id",
            get(reservations::get_reservation).delete(reservations::cancel_reservation),
        )
        .route("/reservations/:id/confirm", post(reservations::confirm_reservation))
        // Bookings
        .route("/bookings", post(bookings::create_booking))
        .route("/bookings/validate", post(bookings::validate_booking))
        .route("/bookings/recurring", post(bookings::create_series))
        .route("/bookings/:id", get(bookings::get_booking))
        .route("/bookings/:id/status", patch(bookings::update_status))
        .route("/bookings/:id/reschedule", patch(bookings::reschedule))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
