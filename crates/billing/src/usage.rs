//! Usage tracking
//!
//! The write-heavy half of the engine. Deductions are optimistic: a track
//! call deducts whatever the locked entitlement rows can absorb and never
//! blocks the caller on the processor. Row locks on the feature's
//! entitlements serialize concurrent tracks for the same feature; tracks for
//! different features proceed in parallel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_shared::{CustomerId, EntityId};
use uuid::Uuid;

use crate::balance::{aggregate_feature, plan_deduction, BalanceSource, FeatureBalance};
use crate::cache::BalanceCache;
use crate::catalog::{CatalogService, FeatureKind};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{CustomerEntitlement, LedgerService};

#[derive(Debug, Clone, Deserialize)]
pub struct TrackParams {
    pub feature_id: String,
    #[serde(default = "default_value")]
    pub value: i64,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    /// Replays of the same key are acknowledged without deducting again
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_value() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackOutcome {
    pub event_id: Option<Uuid>,
    /// Spend the entitlements could not absorb (clamped, not billed)
    pub unapplied: i64,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub balance: Option<FeatureBalance>,
}

/// Tracks usage and serves balance reads
#[derive(Clone)]
pub struct UsageService {
    ledger: LedgerService,
    catalog: CatalogService,
    events: BillingEventLogger,
    cache: Arc<dyn BalanceCache>,
}

impl UsageService {
    pub fn new(
        ledger: LedgerService,
        catalog: CatalogService,
        events: BillingEventLogger,
        cache: Arc<dyn BalanceCache>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            events,
            cache,
        }
    }

    /// Record usage against a feature, deducting from the customer's balances.
    ///
    /// Deduction order is soonest-expiring rollovers first, then current
    /// balances oldest product first; overage past all balances goes negative
    /// only on an instance that allows it, and is otherwise clamped and
    /// reported as `unapplied`.
    pub async fn track(
        &self,
        customer_id: CustomerId,
        params: &TrackParams,
    ) -> BillingResult<TrackOutcome> {
        let feature = self.catalog.get_feature(&params.feature_id).await?;
        if feature.kind == FeatureKind::Boolean {
            return Err(BillingError::Validation(format!(
                "Feature {} is boolean and cannot be tracked",
                feature.id
            )));
        }

        let mut tx = self.ledger.pool().begin().await?;

        if let Some(key) = params.idempotency_key.as_deref() {
            if let Some(event_id) = self.find_tracked(&mut tx, key).await? {
                return Ok(TrackOutcome {
                    event_id: Some(event_id),
                    unapplied: 0,
                    replayed: true,
                });
            }
        }

        let ents = self
            .ledger
            .lock_feature_entitlements(&mut tx, customer_id, &params.feature_id, params.entity_id)
            .await?;

        let unapplied = if ents.iter().any(|e| e.unlimited) {
            // Unlimited grants absorb everything; the event still records the
            // spend for reporting
            0
        } else {
            let outcome = plan_deduction(&ents, params.value);
            for (ent, m) in ents.iter().zip(outcome.mutations.iter()) {
                if ent.balance != m.balance || ent.rollovers != m.rollovers {
                    self.ledger
                        .update_entitlement_balance(
                            &mut tx,
                            m.entitlement_id,
                            m.balance,
                            &m.rollovers,
                            ent.next_reset_at,
                        )
                        .await?;
                }
            }
            outcome.unapplied
        };

        let event_id = self
            .insert_usage_event(&mut tx, customer_id, params, unapplied)
            .await?;
        tx.commit().await?;

        if let Err(e) = self.cache.invalidate(customer_id).await {
            tracing::warn!(customer_id = %customer_id, error = %e, "Balance cache invalidation failed");
        }
        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(customer_id, BillingEventType::UsageRecorded)
                    .data(serde_json::json!({
                        "feature_id": params.feature_id,
                        "value": params.value,
                        "entity_id": params.entity_id,
                        "unapplied": unapplied,
                    }))
                    .actor(ActorType::Api),
            )
            .await
        {
            tracing::warn!(customer_id = %customer_id, error = %e, "Failed to log usage event");
        }

        if unapplied > 0 {
            tracing::debug!(
                customer_id = %customer_id,
                feature_id = %params.feature_id,
                unapplied = unapplied,
                "Usage exceeded available balance without overage permission"
            );
        }

        Ok(TrackOutcome {
            event_id: Some(event_id),
            unapplied,
            replayed: false,
        })
    }

    /// Gate check: can this customer spend `required` units of a feature?
    ///
    /// Reads without locks, so a concurrent track can race it. Callers that
    /// need exactness pair the check with a subsequent track and inspect
    /// `unapplied`.
    pub async fn check(
        &self,
        customer_id: CustomerId,
        feature_id: &str,
        required: i64,
        entity_id: Option<EntityId>,
    ) -> BillingResult<CheckOutcome> {
        let feature = self.catalog.get_feature(feature_id).await?;
        let ents = self.ledger.live_entitlements(customer_id).await?;
        let products = self.ledger.customer_products(customer_id).await?;

        let sources = scoped_sources(&ents, &products, feature_id, entity_id);
        let balance = aggregate_feature(&feature, &sources);

        let allowed = match feature.kind {
            FeatureKind::Boolean => balance.enabled == Some(true),
            _ => {
                balance.unlimited
                    || balance.current_balance >= required
                    || sources.iter().any(|s| s.ent.usage_allowed)
            }
        };

        Ok(CheckOutcome {
            allowed,
            balance: if feature.kind == FeatureKind::Boolean {
                None
            } else {
                Some(balance)
            },
        })
    }

    /// Aggregated balances for every feature the customer holds.
    /// Cached per customer; entity-scoped reads bypass the cache.
    pub async fn balances(
        &self,
        customer_id: CustomerId,
        entity_id: Option<EntityId>,
    ) -> BillingResult<Vec<FeatureBalance>> {
        if entity_id.is_none() {
            if let Some(cached) = self.cache.get(customer_id).await? {
                return Ok(cached);
            }
        }

        let ents = self.ledger.live_entitlements(customer_id).await?;
        let products = self.ledger.customer_products(customer_id).await?;

        let mut feature_ids: Vec<&str> = Vec::new();
        for ent in &ents {
            if !feature_ids.contains(&ent.feature_id.as_str()) {
                feature_ids.push(&ent.feature_id);
            }
        }

        let mut balances = Vec::with_capacity(feature_ids.len());
        for feature_id in feature_ids {
            let feature = self.catalog.get_feature(feature_id).await?;
            let sources = scoped_sources(&ents, &products, feature_id, entity_id);
            balances.push(aggregate_feature(&feature, &sources));
        }

        if entity_id.is_none() {
            if let Err(e) = self.cache.set(customer_id, &balances).await {
                tracing::warn!(customer_id = %customer_id, error = %e, "Balance cache write failed");
            }
        }
        Ok(balances)
    }

    /// Set a feature's aggregate current balance to an absolute value.
    ///
    /// The difference from the current aggregate is applied as a deduction
    /// (or, when raising, a credit to the oldest instance), so the same
    /// ordering rules as `track` decide which instance moves.
    pub async fn set_balance(
        &self,
        customer_id: CustomerId,
        feature_id: &str,
        entity_id: Option<EntityId>,
        target: i64,
    ) -> BillingResult<()> {
        let feature = self.catalog.get_feature(feature_id).await?;
        if feature.kind == FeatureKind::Boolean {
            return Err(BillingError::Validation(format!(
                "Feature {} is boolean and has no balance",
                feature.id
            )));
        }

        let mut tx = self.ledger.pool().begin().await?;
        let ents = self
            .ledger
            .lock_feature_entitlements(&mut tx, customer_id, feature_id, entity_id)
            .await?;
        if ents.is_empty() {
            return Err(BillingError::NotFound(format!(
                "Customer {} has no entitlement for feature {}",
                customer_id, feature_id
            )));
        }

        let current: i64 = ents.iter().map(CustomerEntitlement::current).sum();
        let delta = current - target;
        let outcome = plan_deduction(&ents, delta);
        if outcome.unapplied > 0 {
            return Err(BillingError::Validation(format!(
                "Cannot lower balance for feature {} below zero without overage permission",
                feature_id
            )));
        }
        for (ent, m) in ents.iter().zip(outcome.mutations.iter()) {
            if ent.balance != m.balance || ent.rollovers != m.rollovers {
                self.ledger
                    .update_entitlement_balance(
                        &mut tx,
                        m.entitlement_id,
                        m.balance,
                        &m.rollovers,
                        ent.next_reset_at,
                    )
                    .await?;
            }
        }
        tx.commit().await?;

        if let Err(e) = self.cache.invalidate(customer_id).await {
            tracing::warn!(customer_id = %customer_id, error = %e, "Balance cache invalidation failed");
        }
        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(customer_id, BillingEventType::BalanceAdjusted)
                    .data(serde_json::json!({
                        "feature_id": feature_id,
                        "entity_id": entity_id,
                        "target": target,
                        "previous": current,
                    }))
                    .actor(ActorType::Api),
            )
            .await
        {
            tracing::warn!(customer_id = %customer_id, error = %e, "Failed to log balance adjustment");
        }
        Ok(())
    }

    async fn find_tracked(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        idempotency_key: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM usage_events WHERE idempotency_key = $1")
                .bind(idempotency_key)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn insert_usage_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        customer_id: CustomerId,
        params: &TrackParams,
        unapplied: i64,
    ) -> BillingResult<Uuid> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO usage_events (customer_id, feature_id, entity_id, value, unapplied, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(customer_id.0)
        .bind(&params.feature_id)
        .bind(params.entity_id.map(|e| e.0))
        .bind(params.value)
        .bind(unapplied)
        .bind(&params.idempotency_key)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.0)
    }
}

/// Filter entitlements to one feature and entity scope, pairing each with its
/// owning product id. Entity-scoped grants only count for reads within that
/// entity; customer-wide grants count everywhere.
fn scoped_sources<'a>(
    ents: &'a [CustomerEntitlement],
    products: &'a [crate::ledger::CustomerProduct],
    feature_id: &str,
    entity_id: Option<EntityId>,
) -> Vec<BalanceSource<'a>> {
    ents.iter()
        .filter(|e| e.feature_id == feature_id)
        .filter(|e| match (e.entity_id, entity_id) {
            (None, _) => true,
            (Some(owned), Some(requested)) => owned == requested,
            (Some(_), None) => false,
        })
        .filter_map(|e| {
            products
                .iter()
                .find(|p| p.id == e.customer_product_id)
                .map(|p| BalanceSource {
                    ent: e,
                    product_id: p.product_id.as_str(),
                })
        })
        .collect()
}
