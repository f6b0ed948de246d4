//! Consistency verification sweep
//!
//! Rotates through customers with processor state, least-recently-checked
//! first, and runs the ledger-vs-processor comparison on each. Afterward it
//! reads the trailing fleet rate and raises an error log when it breaches
//! the threshold.

use tally_shared::CustomerId;
use tracing::{error, info};

use crate::services::WorkerServices;

const BATCH_SIZE: i64 = 20;
const FLEET_WINDOW_HOURS: i64 = 24;

pub async fn run_verification_sweep(services: &WorkerServices) {
    let customers: Vec<(CustomerId,)> = match sqlx::query_as(
        r#"
        SELECT c.id
        FROM customers c
        LEFT JOIN (
            SELECT customer_id, MAX(checked_at) AS last_checked_at
            FROM consistency_checks
            GROUP BY customer_id
        ) k ON k.customer_id = c.id
        WHERE c.processor_customer_id IS NOT NULL
        ORDER BY k.last_checked_at ASC NULLS FIRST
        LIMIT $1
        "#,
    )
    .bind(BATCH_SIZE)
    .fetch_all(&services.pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to select customers for verification");
            return;
        }
    };

    let mut inconsistent = 0;
    for (customer_id,) in &customers {
        match services.verifier.verify_customer(*customer_id).await {
            Ok(report) if !report.consistent => {
                inconsistent += 1;
            }
            Ok(_) => {}
            Err(e) => {
                error!(customer_id = %customer_id, error = %e, "Verification failed");
            }
        }
    }
    if !customers.is_empty() {
        info!(
            checked = customers.len(),
            inconsistent = inconsistent,
            "Verification sweep complete"
        );
    }

    match services
        .verifier
        .fleet_health(time::Duration::hours(FLEET_WINDOW_HOURS))
        .await
    {
        Ok(health) if health.breached => {
            error!(
                rate = health.rate,
                checked = health.checked,
                consistent = health.consistent,
                "Fleet consistency rate below threshold"
            );
        }
        Ok(health) => {
            tracing::debug!(rate = health.rate, checked = health.checked, "Fleet consistency healthy");
        }
        Err(e) => {
            error!(error = %e, "Failed to compute fleet health");
        }
    }
}
