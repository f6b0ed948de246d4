//! Reconciliation queue consumer
//!
//! Customers land here when a plan execution failed partway through the
//! processor phase, or when a subscription was canceled from outside the
//! engine. The consumer re-reads the processor, repairs the two divergences
//! it can repair mechanically (a missing subscription link, a ledger row
//! whose subscription died) and hands the rest to the verifier so the
//! anomaly record captures what remains.
//!
//! Claiming is a single UPDATE with SKIP LOCKED inside, so no queue-row lock
//! is held across the processor calls the repair makes. A claimed entry that
//! fails stays claimed until the reclaim window passes, then gets retried,
//! up to the attempt cap.

use sqlx::PgPool;
use tally_billing::ledger::CustomerProductStatus;
use tally_billing::plan::desired_items;
use tally_shared::CustomerId;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use crate::services::WorkerServices;

const BATCH_SIZE: i64 = 10;
const MAX_ATTEMPTS: i32 = 5;

pub async fn run_reconciliation(services: &WorkerServices) {
    loop {
        match reconcile_batch(services).await {
            Ok(0) => break,
            Ok(n) => info!(count = n, "Reconciled queued customers"),
            Err(e) => {
                error!(error = %e, "Reconciliation batch failed");
                break;
            }
        }
    }
}

/// Claim a batch of due entries in one statement. SKIP LOCKED keeps
/// concurrent workers off the same rows; the claim stamp keeps them off
/// rows another worker claimed and is still repairing.
async fn claim_batch(pool: &PgPool) -> anyhow::Result<Vec<(Uuid, Uuid, String)>> {
    let claimed = sqlx::query_as(
        r#"
        UPDATE reconciliation_queue q
        SET claimed_at = NOW(), attempts = q.attempts + 1
        FROM (
            SELECT id
            FROM reconciliation_queue
            WHERE processed_at IS NULL
              AND attempts < $2
              AND (claimed_at IS NULL OR claimed_at < NOW() - INTERVAL '10 minutes')
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        ) due
        WHERE q.id = due.id
        RETURNING q.id, q.customer_id, q.reason
        "#,
    )
    .bind(BATCH_SIZE)
    .bind(MAX_ATTEMPTS)
    .fetch_all(pool)
    .await?;
    Ok(claimed)
}

async fn reconcile_batch(services: &WorkerServices) -> anyhow::Result<usize> {
    let claimed = claim_batch(&services.pool).await?;
    if claimed.is_empty() {
        return Ok(0);
    }

    let mut processed = 0;
    for (queue_id, customer_id, reason) in &claimed {
        let customer_id = CustomerId(*customer_id);

        match reconcile_customer(services, customer_id).await {
            Ok(()) => {
                sqlx::query("UPDATE reconciliation_queue SET processed_at = NOW() WHERE id = $1")
                    .bind(*queue_id)
                    .execute(&services.pool)
                    .await?;
                processed += 1;
            }
            Err(e) => {
                // Stays claimed; retried after the reclaim window, until the
                // attempt cap takes it out of rotation
                error!(
                    customer_id = %customer_id,
                    reason = %reason,
                    error = %e,
                    "Customer reconciliation failed"
                );
            }
        }
    }
    Ok(processed)
}

async fn reconcile_customer(
    services: &WorkerServices,
    customer_id: CustomerId,
) -> anyhow::Result<()> {
    let customer = services.ledger.get_customer(customer_id).await?;
    let processor_customer_id = match customer.processor_customer_id.as_deref() {
        Some(id) => id,
        // Nothing processor-side can have diverged
        None => return Ok(()),
    };

    let snapshot = services.processor.fetch_snapshot(processor_customer_id).await?;
    let products = services.ledger.customer_products(customer_id).await?;

    let mut tx = services.ledger.pool().begin().await?;
    services.ledger.lock_customer(&mut tx, customer_id).await?;
    let now = OffsetDateTime::now_utc();

    let claimed: Vec<String> = products
        .iter()
        .filter_map(|p| p.processor_subscription_id.clone())
        .collect();

    for product in &products {
        if !product.status.is_live() || product.status == CustomerProductStatus::Scheduled {
            continue;
        }

        match product.processor_subscription_id.as_deref() {
            Some(sub_id) => {
                // The subscription the row points at no longer exists live;
                // the paid attachment ends with it
                if snapshot.subscription(sub_id).is_none() {
                    let def = services
                        .catalog
                        .get_product_version(&product.product_id, product.product_version)
                        .await?;
                    if !desired_items(&def, &product.options).is_empty() {
                        services.ledger.expire_customer_product(&mut tx, product.id, now).await?;
                        info!(
                            customer_id = %customer_id,
                            customer_product_id = %product.id,
                            subscription_id = %sub_id,
                            "Expired attachment whose subscription is gone"
                        );
                    }
                }
            }
            None => {
                // An execution that created the subscription but died before
                // the ledger write leaves an unclaimed subscription whose
                // items match what this attachment expects
                let def = services
                    .catalog
                    .get_product_version(&product.product_id, product.product_version)
                    .await?;
                let wanted = desired_items(&def, &product.options);
                if wanted.is_empty() {
                    continue;
                }
                let matched = snapshot.subscriptions.iter().find(|sub| {
                    !claimed.contains(&sub.subscription_id)
                        && wanted
                            .iter()
                            .all(|w| sub.items.iter().any(|i| i.price_id == w.price_id))
                });
                if let Some(sub) = matched {
                    services
                        .ledger
                        .set_processor_subscription(&mut tx, product.id, &sub.subscription_id)
                        .await?;
                    info!(
                        customer_id = %customer_id,
                        customer_product_id = %product.id,
                        subscription_id = %sub.subscription_id,
                        "Backfilled missing subscription link"
                    );
                }
            }
        }
    }

    tx.commit().await?;

    if let Err(e) = services.cache.invalidate(customer_id).await {
        tracing::warn!(customer_id = %customer_id, error = %e, "Balance cache invalidation failed");
    }

    // Whatever the repairs could not fix lands in the anomaly record
    services.verifier.verify_customer(customer_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_claimed_entry_not_reclaimed_within_window() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = tally_shared::create_pool(&url).await.expect("pool");
        tally_shared::run_migrations(&pool).await.expect("migrations");

        let customer_id = CustomerId::new();
        sqlx::query("INSERT INTO customers (id, name) VALUES ($1, 'reconcile-test')")
            .bind(customer_id.0)
            .execute(&pool)
            .await
            .expect("insert customer");
        sqlx::query("INSERT INTO reconciliation_queue (customer_id, reason) VALUES ($1, 'test')")
            .bind(customer_id.0)
            .execute(&pool)
            .await
            .expect("enqueue");

        let first = claim_batch(&pool).await.expect("first claim");
        assert!(first.iter().any(|(_, c, _)| *c == customer_id.0));

        // Still unprocessed, but claimed: a second sweep must skip it
        let second = claim_batch(&pool).await.expect("second claim");
        assert!(!second.iter().any(|(_, c, _)| *c == customer_id.0));

        sqlx::query(
            "UPDATE reconciliation_queue SET processed_at = NOW() WHERE customer_id = $1",
        )
        .bind(customer_id.0)
        .execute(&pool)
        .await
        .expect("cleanup");
    }
}
