//! Usage tracking and balance routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tally_billing::balance::FeatureBalance;
use tally_billing::usage::{CheckOutcome, TrackOutcome, TrackParams};
use tally_shared::{CustomerId, EntityId};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    pub customer_id: CustomerId,
    #[serde(flatten)]
    pub params: TrackParams,
}

/// Record usage against a feature. Deducts optimistically and never blocks
/// on the processor; overage past all balances is clamped unless the
/// entitlement permits it.
pub async fn track(
    State(state): State<AppState>,
    Json(req): Json<TrackRequest>,
) -> ApiResult<Json<TrackOutcome>> {
    let outcome = state.usage.track(req.customer_id, &req.params).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub customer_id: CustomerId,
    pub feature_id: String,
    #[serde(default = "default_required")]
    pub required: i64,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
}

fn default_required() -> i64 {
    1
}

/// Gate check: whether the customer can spend `required` units right now.
pub async fn check(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> ApiResult<Json<CheckOutcome>> {
    let outcome = state
        .usage
        .check(req.customer_id, &req.feature_id, req.required, req.entity_id)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct BalancesQuery {
    #[serde(default)]
    pub entity_id: Option<EntityId>,
}

#[derive(Debug, Serialize)]
pub struct BalancesResponse {
    pub balances: Vec<FeatureBalance>,
}

/// Aggregated balances for every feature the customer holds.
pub async fn balances(
    State(state): State<AppState>,
    Path(customer_id): Path<CustomerId>,
    Query(query): Query<BalancesQuery>,
) -> ApiResult<Json<BalancesResponse>> {
    let balances = state.usage.balances(customer_id, query.entity_id).await?;
    Ok(Json(BalancesResponse { balances }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBalanceRequest {
    pub customer_id: CustomerId,
    pub feature_id: String,
    /// Absolute target for the aggregate current balance
    pub balance: i64,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
}

/// Set a feature balance to an absolute value (support/admin path). The
/// delta runs through the same deduction ordering as `track`.
pub async fn update_balance(
    State(state): State<AppState>,
    Json(req): Json<UpdateBalanceRequest>,
) -> ApiResult<Json<BalancesResponse>> {
    state
        .usage
        .set_balance(req.customer_id, &req.feature_id, req.entity_id, req.balance)
        .await?;
    let balances = state.usage.balances(req.customer_id, req.entity_id).await?;
    Ok(Json(BalancesResponse { balances }))
}
