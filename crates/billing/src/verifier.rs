//! Consistency verification
//!
//! Periodically compares what the ledger says a customer holds against what
//! the processor says they are subscribed to, and records the drift. This
//! module detects and reports; it never repairs. Repair stays a human
//! decision fed by the anomaly records.

use serde::{Deserialize, Serialize};
use tally_shared::CustomerId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::CatalogService;
use crate::context::{ProcessorSnapshot, SubscriptionState};
use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{CustomerEntitlement, CustomerProduct, CustomerProductStatus, LedgerService};
use crate::plan::{desired_items, PlanItem};
use crate::processor::ProcessorClient;

/// Fleet consistency below this rate is an operational incident
pub const CONSISTENCY_THRESHOLD: f64 = 0.995;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// Ledger says the customer pays for a product; processor has no
    /// matching live subscription
    MissingSubscription,
    /// Processor bills a subscription no live ledger row accounts for
    OrphanSubscription,
    /// Subscription exists but its status contradicts the ledger
    StatusMismatch,
    /// Subscription items disagree with what the attached products imply
    ItemMismatch,
    /// Ledger marked canceled-at-period-end but the processor will renew
    CancellationMismatch,
    /// A ledger mutation's usage delta nearly consumed its granted delta
    UsageDrift,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub customer_product_id: Option<Uuid>,
    pub subscription_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub customer_id: CustomerId,
    pub consistent: bool,
    pub anomalies: Vec<Anomaly>,
    pub checked_at: OffsetDateTime,
}

/// Fraction of recent checks that found no drift
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FleetHealth {
    pub checked: i64,
    pub consistent: i64,
    pub rate: f64,
    pub breached: bool,
}

#[derive(Clone)]
pub struct ConsistencyVerifier {
    ledger: LedgerService,
    catalog: CatalogService,
    processor: ProcessorClient,
    events: BillingEventLogger,
}

impl ConsistencyVerifier {
    pub fn new(
        ledger: LedgerService,
        catalog: CatalogService,
        processor: ProcessorClient,
        events: BillingEventLogger,
    ) -> Self {
        Self {
            ledger,
            catalog,
            processor,
            events,
        }
    }

    /// Verify one customer and record the result.
    pub async fn verify_customer(&self, customer_id: CustomerId) -> BillingResult<VerificationReport> {
        let customer = self.ledger.get_customer(customer_id).await?;
        let products = self.ledger.customer_products(customer_id).await?;

        let snapshot = match customer.processor_customer_id.as_deref() {
            Some(id) => self.processor.fetch_snapshot(id).await?,
            None => ProcessorSnapshot::default(),
        };

        let mut expected = Vec::with_capacity(products.len());
        for product in products {
            if !product.status.is_live() {
                continue;
            }
            let def = self
                .catalog
                .get_product_version(&product.product_id, product.product_version)
                .await?;
            let items = desired_items(&def, &product.options);
            expected.push((product, items));
        }

        let anomalies = compare_ledger_to_processor(&expected, &snapshot);
        let checked_at = OffsetDateTime::now_utc();
        let consistent = anomalies.is_empty();

        sqlx::query(
            r#"
            INSERT INTO consistency_checks (customer_id, consistent, anomalies, checked_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(customer_id.0)
        .bind(consistent)
        .bind(sqlx::types::Json(&anomalies))
        .bind(checked_at)
        .execute(self.ledger.pool())
        .await?;

        for anomaly in &anomalies {
            tracing::warn!(
                customer_id = %customer_id,
                kind = ?anomaly.kind,
                subscription_id = ?anomaly.subscription_id,
                detail = %anomaly.detail,
                "Consistency anomaly detected"
            );
            let mut builder =
                BillingEventBuilder::new(customer_id, BillingEventType::ConsistencyAnomaly)
                    .data(serde_json::json!(anomaly));
            if let Some(sub_id) = &anomaly.subscription_id {
                builder = builder.processor_subscription(sub_id.clone());
            }
            if let Err(e) = self.events.log_event(builder).await {
                tracing::warn!(customer_id = %customer_id, error = %e, "Failed to log anomaly event");
            }
        }

        Ok(VerificationReport {
            customer_id,
            consistent,
            anomalies,
            checked_at,
        })
    }

    /// Consistency rate over the trailing window of checks.
    pub async fn fleet_health(&self, window: time::Duration) -> BillingResult<FleetHealth> {
        let since = OffsetDateTime::now_utc() - window;
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(*) FILTER (WHERE consistent)
            FROM consistency_checks
            WHERE checked_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(self.ledger.pool())
        .await?;

        let (checked, consistent) = row;
        let rate = if checked == 0 {
            1.0
        } else {
            consistent as f64 / checked as f64
        };
        Ok(FleetHealth {
            checked,
            consistent,
            rate,
            breached: rate < CONSISTENCY_THRESHOLD,
        })
    }
}

impl ConsistencyVerifier {
    /// Record a drift anomaly from a just-applied ledger mutation.
    ///
    /// Callers pass the entitlement rows as they stood before and after the
    /// mutation; detection never fails the request path, so errors here are
    /// logged and swallowed.
    pub async fn record_mutation_drift(
        &self,
        customer_id: CustomerId,
        before: &[CustomerEntitlement],
        after: &[CustomerEntitlement],
    ) {
        let anomaly = match check_mutation_drift(before, after) {
            Some(anomaly) => anomaly,
            None => return,
        };

        tracing::warn!(
            customer_id = %customer_id,
            detail = %anomaly.detail,
            "Usage drift detected after ledger mutation"
        );

        let insert = sqlx::query(
            r#"
            INSERT INTO consistency_checks (customer_id, consistent, anomalies, checked_at)
            VALUES ($1, FALSE, $2, NOW())
            "#,
        )
        .bind(customer_id.0)
        .bind(sqlx::types::Json(vec![&anomaly]))
        .execute(self.ledger.pool())
        .await;
        if let Err(e) = insert {
            tracing::error!(customer_id = %customer_id, error = %e, "Failed to record drift anomaly");
        }

        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(customer_id, BillingEventType::ConsistencyAnomaly)
                    .data(serde_json::json!(anomaly)),
            )
            .await
        {
            tracing::warn!(customer_id = %customer_id, error = %e, "Failed to log drift event");
        }
    }
}

/// Flag a mutation whose usage delta consumed (nearly) all of its granted
/// delta: a grant that arrives already spent means the deduction path and
/// the plan path disagree about the same units.
pub fn check_mutation_drift(
    before: &[CustomerEntitlement],
    after: &[CustomerEntitlement],
) -> Option<Anomaly> {
    let granted_delta: i64 = after.iter().map(|e| e.granted()).sum::<i64>()
        - before.iter().map(|e| e.granted()).sum::<i64>();
    let usage_delta: i64 = after.iter().map(|e| e.used()).sum::<i64>()
        - before.iter().map(|e| e.used()).sum::<i64>();

    if granted_delta <= 0 || usage_delta <= 0 {
        return None;
    }
    if (usage_delta as f64) < CONSISTENCY_THRESHOLD * granted_delta as f64 {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::UsageDrift,
        customer_product_id: None,
        subscription_id: None,
        detail: format!(
            "Mutation granted {} units but usage rose by {}",
            granted_delta, usage_delta
        ),
    })
}

/// Pure comparison of the ledger's expected state against a processor
/// snapshot. `expected` carries each live attachment with the subscription
/// items its product definition implies.
pub fn compare_ledger_to_processor(
    expected: &[(CustomerProduct, Vec<PlanItem>)],
    snapshot: &ProcessorSnapshot,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    for (product, items) in expected {
        // Free products and pure-included products occupy no subscription
        if items.is_empty() {
            continue;
        }

        let sub = product
            .processor_subscription_id
            .as_deref()
            .and_then(|id| snapshot.subscription(id));

        let sub = match sub {
            Some(sub) => sub,
            None => {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::MissingSubscription,
                    customer_product_id: Some(product.id),
                    subscription_id: product.processor_subscription_id.clone(),
                    detail: format!(
                        "Product {} v{} is {} in the ledger but has no live subscription",
                        product.product_id, product.product_version, product.status
                    ),
                });
                continue;
            }
        };

        if let Some(anomaly) = status_anomaly(product, sub) {
            anomalies.push(anomaly);
        }

        for want in items {
            match sub.items.iter().find(|i| i.price_id == want.price_id) {
                None => anomalies.push(Anomaly {
                    kind: AnomalyKind::ItemMismatch,
                    customer_product_id: Some(product.id),
                    subscription_id: Some(sub.subscription_id.clone()),
                    detail: format!(
                        "Price {} expected on subscription {} but absent",
                        want.price_id, sub.subscription_id
                    ),
                }),
                Some(have) if have.quantity != want.quantity => anomalies.push(Anomaly {
                    kind: AnomalyKind::ItemMismatch,
                    customer_product_id: Some(product.id),
                    subscription_id: Some(sub.subscription_id.clone()),
                    detail: format!(
                        "Price {} quantity {:?} in processor, {:?} expected",
                        want.price_id, have.quantity, want.quantity
                    ),
                }),
                Some(_) => {}
            }
        }
    }

    // Items no attachment accounts for, on subscriptions the ledger knows
    for sub in &snapshot.subscriptions {
        if !is_live_subscription(sub) {
            continue;
        }
        let owners: Vec<&(CustomerProduct, Vec<PlanItem>)> = expected
            .iter()
            .filter(|(p, _)| p.processor_subscription_id.as_deref() == Some(&sub.subscription_id))
            .collect();
        if owners.is_empty() {
            anomalies.push(Anomaly {
                kind: AnomalyKind::OrphanSubscription,
                customer_product_id: None,
                subscription_id: Some(sub.subscription_id.clone()),
                detail: format!(
                    "Subscription {} ({}) has no live ledger attachment",
                    sub.subscription_id, sub.status
                ),
            });
            continue;
        }
        for item in &sub.items {
            let accounted = owners
                .iter()
                .any(|(_, items)| items.iter().any(|w| w.price_id == item.price_id));
            if !accounted {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::ItemMismatch,
                    customer_product_id: None,
                    subscription_id: Some(sub.subscription_id.clone()),
                    detail: format!(
                        "Price {} billed on subscription {} but owned by no attachment",
                        item.price_id, sub.subscription_id
                    ),
                });
            }
        }
    }

    anomalies
}

fn is_live_subscription(sub: &SubscriptionState) -> bool {
    matches!(sub.status.as_str(), "active" | "trialing" | "past_due")
}

fn status_anomaly(product: &CustomerProduct, sub: &SubscriptionState) -> Option<Anomaly> {
    let acceptable: &[&str] = match product.status {
        CustomerProductStatus::Trialing => &["trialing"],
        // A trial may have just converted; both are coherent for an active row
        CustomerProductStatus::Active => &["active", "trialing"],
        CustomerProductStatus::PastDue => &["past_due", "unpaid", "active"],
        _ => return None,
    };
    if !acceptable.contains(&sub.status.as_str()) {
        return Some(Anomaly {
            kind: AnomalyKind::StatusMismatch,
            customer_product_id: Some(product.id),
            subscription_id: Some(sub.subscription_id.clone()),
            detail: format!(
                "Ledger status {} but subscription {} is {}",
                product.status, sub.subscription_id, sub.status
            ),
        });
    }
    if product.canceled_at.is_some() && !sub.cancel_at_period_end && sub.schedule_id.is_none() {
        return Some(Anomaly {
            kind: AnomalyKind::CancellationMismatch,
            customer_product_id: Some(product.id),
            subscription_id: Some(sub.subscription_id.clone()),
            detail: format!(
                "Ledger marks product {} canceled at period end but subscription {} will renew",
                product.product_id, sub.subscription_id
            ),
        });
    }
    None
}
