//! Product attachment routes
//!
//! Every mutating handler follows the same shape: take the per-customer
//! lock, build the billing context, compute a plan, execute it, commit.
//! The plan computation itself is pure; these handlers own the plumbing.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tally_billing::context::AttachTarget;
use tally_billing::events::ActorType;
use tally_billing::plan::{
    compute_cancel_plan, compute_plan, BillingBehavior, PlanTiming, TransitionKind,
};
use tally_shared::CustomerId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub customer_id: CustomerId,
    pub products: Vec<AttachTarget>,
    #[serde(default)]
    pub behavior: BillingBehavior,
    #[serde(default)]
    pub timing: PlanTiming,
    /// Caller-supplied key; generated when absent, so only callers that pass
    /// one get cross-request replay protection
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AttachResponse {
    pub operation_id: Uuid,
    pub transition: TransitionKind,
    pub due_now_cents: i64,
    pub next_cycle_cents: i64,
    pub replayed: bool,
}

/// Attach products, applying whatever transition the customer's current
/// state implies (new attach, upgrade, downgrade, trial conversion, merge).
pub async fn attach(
    State(state): State<AppState>,
    Json(req): Json<AttachRequest>,
) -> ApiResult<Json<AttachResponse>> {
    let now = OffsetDateTime::now_utc();
    let idempotency_key = req
        .idempotency_key
        .unwrap_or_else(|| format!("attach:{}", Uuid::new_v4()));

    let mut tx = state.executor.begin_locked(req.customer_id).await?;
    let ctx = state.context.build(req.customer_id, &req.products, now).await?;
    let before = ctx.entitlements.clone();
    let plan = compute_plan(&ctx, req.behavior, req.timing)?;
    let next_cycle_cents = plan.next_cycle_cents;

    let outcome = state
        .executor
        .execute(&mut tx, &ctx.customer, &plan, &idempotency_key, ActorType::Api)
        .await?;
    tx.commit().await.map_err(tally_billing::BillingError::from)?;

    let after = state.ledger.live_entitlements(req.customer_id).await?;
    state
        .verifier
        .record_mutation_drift(req.customer_id, &before, &after)
        .await;

    Ok(Json(AttachResponse {
        operation_id: outcome.operation_id,
        transition: outcome.transition,
        due_now_cents: outcome.due_now_cents,
        next_cycle_cents,
        replayed: outcome.replayed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub customer_id: CustomerId,
    pub products: Vec<AttachTarget>,
    #[serde(default)]
    pub behavior: BillingBehavior,
    #[serde(default)]
    pub timing: PlanTiming,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub transition: TransitionKind,
    pub due_now_cents: i64,
    pub next_cycle_cents: i64,
    /// Hosted payment page when the attach needs payment collection first.
    /// The attach itself happens when the completion webhook arrives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

/// Preview a plan without executing it. When the plan would create a paid
/// subscription, a hosted checkout session is returned; completing it
/// replays these targets through the attach pipeline via webhook.
pub async fn checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let now = OffsetDateTime::now_utc();

    let ctx = state.context.build(req.customer_id, &req.products, now).await?;
    let plan = compute_plan(&ctx, req.behavior, req.timing)?;

    let needs_payment_page = plan.processor.iter().any(|op| {
        matches!(
            op,
            tally_billing::plan::ProcessorOp::CreateSubscription { .. }
        )
    });

    let checkout_url = match (&ctx.customer.processor_customer_id, needs_payment_page) {
        (Some(processor_customer_id), true) => {
            let items = plan
                .processor
                .iter()
                .find_map(|op| match op {
                    tally_billing::plan::ProcessorOp::CreateSubscription { items, .. } => {
                        Some(items.clone())
                    }
                    _ => None,
                })
                .unwrap_or_default();
            let mut metadata = HashMap::new();
            metadata.insert("customer_id".to_string(), req.customer_id.to_string());
            metadata.insert(
                "targets".to_string(),
                serde_json::to_string(&req.products).map_err(|e| {
                    ApiError::Validation(format!("Unserializable attach targets: {}", e))
                })?,
            );
            Some(
                state
                    .processor
                    .create_checkout_session(processor_customer_id, &items, metadata)
                    .await?,
            )
        }
        _ => None,
    };

    Ok(Json(CheckoutResponse {
        transition: plan.transition,
        due_now_cents: plan.due_now_cents,
        next_cycle_cents: plan.next_cycle_cents,
        checkout_url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub customer_id: CustomerId,
    pub customer_product_id: Uuid,
    /// Expire now instead of at the period boundary
    #[serde(default)]
    pub immediate: bool,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub operation_id: Uuid,
    pub replayed: bool,
}

/// Cancel one attachment: at the period boundary by default, immediately on
/// request. On a shared subscription only the product's own items come off.
pub async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<CancelResponse>> {
    let now = OffsetDateTime::now_utc();
    let idempotency_key = req
        .idempotency_key
        .unwrap_or_else(|| format!("cancel:{}", Uuid::new_v4()));

    let mut tx = state.executor.begin_locked(req.customer_id).await?;
    let ctx = state.context.build(req.customer_id, &[], now).await?;
    let plan = compute_cancel_plan(&ctx, req.customer_product_id, req.immediate)?;

    let outcome = state
        .executor
        .execute(&mut tx, &ctx.customer, &plan, &idempotency_key, ActorType::Api)
        .await?;
    tx.commit().await.map_err(tally_billing::BillingError::from)?;

    Ok(Json(CancelResponse {
        operation_id: outcome.operation_id,
        replayed: outcome.replayed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub customer_id: CustomerId,
    pub product_id: String,
    /// Catalog version to move the customer onto
    pub to_version: i32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Move a customer from one catalog version of a product to another,
/// preserving usage already consumed this period.
pub async fn migrate(
    State(state): State<AppState>,
    Json(req): Json<MigrateRequest>,
) -> ApiResult<Json<AttachResponse>> {
    let now = OffsetDateTime::now_utc();
    let idempotency_key = req
        .idempotency_key
        .unwrap_or_else(|| format!("migrate:{}", Uuid::new_v4()));

    let current = state
        .ledger
        .customer_products(req.customer_id)
        .await?
        .into_iter()
        .find(|p| p.product_id == req.product_id && p.status.is_live())
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "Customer has no live attachment of product {}",
                req.product_id
            ))
        })?;

    let target = AttachTarget {
        product_id: req.product_id.clone(),
        version: Some(req.to_version),
        options: current.options.clone(),
        entity_id: current.entity_id,
    };

    let mut tx = state.executor.begin_locked(req.customer_id).await?;
    let ctx = state
        .context
        .build(req.customer_id, std::slice::from_ref(&target), now)
        .await?;
    let plan = compute_plan(&ctx, BillingBehavior::default(), PlanTiming::default())?;
    let next_cycle_cents = plan.next_cycle_cents;

    let outcome = state
        .executor
        .execute(&mut tx, &ctx.customer, &plan, &idempotency_key, ActorType::Api)
        .await?;
    tx.commit().await.map_err(tally_billing::BillingError::from)?;

    Ok(Json(AttachResponse {
        operation_id: outcome.operation_id,
        transition: outcome.transition,
        due_now_cents: outcome.due_now_cents,
        next_cycle_cents,
        replayed: outcome.replayed,
    }))
}
