//! Reset boundary sweep
//!
//! Crosses reset boundaries for due entitlements: expired rollovers drop,
//! unused balance carries under the policy cap, the balance returns to the
//! full per-period grant. Each entitlement moves in its own transaction so
//! one poisoned row cannot wedge the sweep.

use tally_billing::balance::apply_reset;
use tally_billing::events::{BillingEventBuilder, BillingEventType};
use time::OffsetDateTime;
use tracing::{error, info};

use crate::services::WorkerServices;

const BATCH_SIZE: i64 = 100;

pub async fn run_reset_sweep(services: &WorkerServices) {
    let now = OffsetDateTime::now_utc();
    let due = match services.ledger.due_for_reset(now, BATCH_SIZE).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to query due resets");
            return;
        }
    };
    if due.is_empty() {
        return;
    }

    info!(count = due.len(), "Processing reset boundaries");
    let mut applied = 0;
    let mut errors = 0;

    for stale in due {
        match reset_one(services, stale.id, now).await {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(e) => {
                error!(entitlement_id = %stale.id, error = %e, "Reset failed");
                errors += 1;
            }
        }
    }

    info!(applied = applied, errors = errors, "Reset sweep complete");
}

async fn reset_one(
    services: &WorkerServices,
    ent_id: uuid::Uuid,
    now: OffsetDateTime,
) -> anyhow::Result<bool> {
    let mut tx = services.ledger.pool().begin().await?;

    // Re-check under the row lock: a concurrent plan mutation may have
    // replaced or already reset this entitlement
    let ent = match services.ledger.lock_entitlement(&mut tx, ent_id).await? {
        Some(ent) => ent,
        None => return Ok(false),
    };
    let boundary = match ent.next_reset_at {
        Some(at) if at <= now => at,
        _ => return Ok(false),
    };

    let policy = match services.ledger.get_customer_product(ent.customer_product_id).await? {
        Some(product) => services
            .catalog
            .get_product_version(&product.product_id, product.product_version)
            .await?
            .item_for_feature(&ent.feature_id)
            .and_then(|item| item.rollover),
        None => None,
    };

    let outcome = apply_reset(&ent, policy, boundary);
    services
        .ledger
        .update_entitlement_balance(
            &mut tx,
            ent.id,
            outcome.balance,
            &outcome.rollovers,
            outcome.next_reset_at,
        )
        .await?;

    // Replacement credits that expire at the reset die with it
    if ent.replaceables > 0 {
        let expired = match ent.replaceables_expire_at {
            Some(at) => at <= now,
            None => true,
        };
        if expired {
            services
                .ledger
                .set_replaceables(&mut tx, ent.id, 0, None)
                .await?;
        }
    }

    tx.commit().await?;

    if let Err(e) = services.cache.invalidate(ent.customer_id).await {
        tracing::warn!(customer_id = %ent.customer_id, error = %e, "Balance cache invalidation failed");
    }
    if let Err(e) = services
        .events
        .log_event(
            BillingEventBuilder::new(ent.customer_id, BillingEventType::BalanceReset).data(
                serde_json::json!({
                    "entitlement_id": ent.id,
                    "feature_id": ent.feature_id,
                    "boundary": boundary.to_string(),
                    "new_balance": outcome.balance,
                }),
            ),
        )
        .await
    {
        tracing::warn!(entitlement_id = %ent.id, error = %e, "Failed to log reset event");
    }
    Ok(true)
}
