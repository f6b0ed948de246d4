//! API routes

pub mod billing;
pub mod health;
pub mod usage;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let v1_routes = Router::new()
        .route("/attach", post(billing::attach))
        .route("/checkout", post(billing::checkout))
        .route("/cancel", post(billing::cancel))
        .route("/migrate", post(billing::migrate))
        .route("/track", post(usage::track))
        .route("/check", post(usage::check))
        .route("/customers/:customer_id/balances", get(usage::balances))
        .route("/balances/update", post(usage::update_balance))
        .route("/webhooks/processor", post(webhooks::processor_webhook));

    Router::new()
        .merge(health_routes)
        .nest("/v1", v1_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
