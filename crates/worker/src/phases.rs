//! Scheduled phase sweep
//!
//! Deferred switches are written as `scheduled` ledger rows starting at the
//! current period's end; the ledger is authoritative for the phase. When the
//! boundary arrives this sweep activates the scheduled row, expires the
//! attachment it displaces, and applies the item diff to the subscription.

use tally_billing::events::{BillingEventBuilder, BillingEventType};
use tally_billing::ledger::{CustomerProduct, CustomerProductStatus};
use tally_billing::plan::phase_item_ops;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::services::WorkerServices;

const BATCH_SIZE: i64 = 50;

pub async fn run_phase_sweep(services: &WorkerServices) {
    let now = OffsetDateTime::now_utc();
    let due = match services.ledger.due_scheduled_products(now, BATCH_SIZE).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to query due scheduled products");
            return;
        }
    };
    if due.is_empty() {
        return;
    }

    info!(count = due.len(), "Activating scheduled product phases");
    for scheduled in due {
        if let Err(e) = activate_one(services, &scheduled, now).await {
            error!(
                customer_product_id = %scheduled.id,
                customer_id = %scheduled.customer_id,
                error = %e,
                "Phase activation failed"
            );
        }
    }
}

async fn activate_one(
    services: &WorkerServices,
    scheduled: &CustomerProduct,
    now: OffsetDateTime,
) -> anyhow::Result<()> {
    let customer = services.ledger.get_customer(scheduled.customer_id).await?;

    let mut tx = services.ledger.pool().begin().await?;
    services
        .ledger
        .lock_customer(&mut tx, scheduled.customer_id)
        .await?;

    // Re-check after the lock; an immediate switch may have raced the sweep
    let current = match services.ledger.get_customer_product(scheduled.id).await? {
        Some(p) if p.status == CustomerProductStatus::Scheduled => p,
        _ => return Ok(()),
    };

    // The attachment this phase displaces: same subscription, canceled, live
    let displaced: Vec<CustomerProduct> = services
        .ledger
        .customer_products(scheduled.customer_id)
        .await?
        .into_iter()
        .filter(|p| {
            p.id != current.id
                && p.status.is_live()
                && p.canceled_at.is_some()
                && p.processor_subscription_id == current.processor_subscription_id
        })
        .collect();

    services.ledger.activate_scheduled(&mut tx, current.id, now).await?;
    for old in &displaced {
        services.ledger.expire_customer_product(&mut tx, old.id, now).await?;
    }

    // Move the subscription's items to the new product's shape. Proration is
    // off processor-side and the phase lands at the boundary, so the diff is
    // charge-neutral.
    if let (Some(processor_customer_id), Some(subscription_id)) = (
        customer.processor_customer_id.as_deref(),
        current.processor_subscription_id.as_deref(),
    ) {
        let snapshot = services.processor.fetch_snapshot(processor_customer_id).await?;
        if let Some(sub) = snapshot.subscription(subscription_id) {
            let def = services
                .catalog
                .get_product_version(&current.product_id, current.product_version)
                .await?;
            let ops = phase_item_ops(sub, &def, &current.options);
            for (index, op) in ops.iter().enumerate() {
                let key = format!("phase:{}:{}", current.id, index);
                services
                    .processor
                    .apply_op(processor_customer_id, op, &key)
                    .await?;
            }
        } else {
            tracing::warn!(
                customer_id = %scheduled.customer_id,
                subscription_id = %subscription_id,
                "Scheduled phase has no backing subscription; ledger activated anyway"
            );
        }
    }

    tx.commit().await?;

    if let Err(e) = services.cache.invalidate(scheduled.customer_id).await {
        tracing::warn!(customer_id = %scheduled.customer_id, error = %e, "Balance cache invalidation failed");
    }
    if let Err(e) = services
        .events
        .log_event(
            BillingEventBuilder::new(scheduled.customer_id, BillingEventType::ProductSwitched)
                .data(serde_json::json!({
                    "customer_product_id": current.id,
                    "product_id": current.product_id,
                    "displaced": displaced.iter().map(|p| p.id).collect::<Vec<_>>(),
                })),
        )
        .await
    {
        tracing::warn!(customer_id = %scheduled.customer_id, error = %e, "Failed to log phase event");
    }

    info!(
        customer_id = %scheduled.customer_id,
        product_id = %current.product_id,
        "Scheduled phase activated"
    );
    Ok(())
}
