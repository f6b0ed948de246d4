//! Billing plan executor
//!
//! Takes a computed `BillingPlan` and makes it real: processor calls first,
//! ledger writes second, all ledger writes inside the caller's transaction.
//! If any processor call fails after retries the transaction is rolled back,
//! the ledger stays untouched, and the customer is queued for reconciliation
//! so the drift between processor and ledger is bounded.
//!
//! Every execution is keyed by a caller-supplied idempotency key. Replaying a
//! completed key returns the recorded outcome without touching the processor;
//! replaying a key that crashed mid-flight reuses the same per-op keys, so the
//! processor dedupes the calls that already happened.

use sqlx::{Postgres, Transaction};
use tally_shared::CustomerId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::BalanceCache;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{Customer, LedgerService};
use crate::plan::{BillingPlan, LedgerMutation, ProcessorOp, TransitionKind};

const RETRY_BASE_DELAY_MS: u64 = 200;
const RETRY_MAX_DELAY: std::time::Duration = std::time::Duration::from_secs(2);
const MAX_RETRIES: usize = 3;

/// What an execution (or a replay of one) produced
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutionOutcome {
    pub operation_id: Uuid,
    pub transition: TransitionKind,
    pub due_now_cents: i64,
    /// True when the idempotency key had already completed and the recorded
    /// outcome was returned as-is
    pub replayed: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: Uuid,
    status: String,
    result: Option<sqlx::types::Json<ExecutionOutcome>>,
}

/// Applies billing plans transactionally
#[derive(Clone)]
pub struct PlanExecutor {
    ledger: LedgerService,
    processor: crate::processor::ProcessorClient,
    events: BillingEventLogger,
    cache: std::sync::Arc<dyn BalanceCache>,
}

impl PlanExecutor {
    pub fn new(
        ledger: LedgerService,
        processor: crate::processor::ProcessorClient,
        events: BillingEventLogger,
        cache: std::sync::Arc<dyn BalanceCache>,
    ) -> Self {
        Self {
            ledger,
            processor,
            events,
            cache,
        }
    }

    /// Open a transaction holding the per-customer advisory lock.
    ///
    /// Callers build the billing context and compute the plan under this
    /// lock, then pass the same transaction to `execute`, so no second
    /// mutation can interleave between the read and the write.
    pub async fn begin_locked(
        &self,
        customer_id: CustomerId,
    ) -> BillingResult<Transaction<'static, Postgres>> {
        let mut tx = self.ledger.pool().begin().await?;
        self.ledger.lock_customer(&mut tx, customer_id).await?;
        Ok(tx)
    }

    /// Execute a plan inside the caller's locked transaction.
    /// The caller commits; a returned error means nothing was committed.
    pub async fn execute(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer: &Customer,
        plan: &BillingPlan,
        idempotency_key: &str,
        actor: ActorType,
    ) -> BillingResult<ExecutionOutcome> {
        if let Some(prior) = self.find_completed(tx, idempotency_key).await? {
            tracing::info!(
                customer_id = %customer.id,
                idempotency_key = %idempotency_key,
                "Replaying completed operation"
            );
            return Ok(ExecutionOutcome {
                replayed: true,
                ..prior
            });
        }

        let operation_id = self
            .record_pending(tx, customer.id, plan, idempotency_key)
            .await?;

        let created = match self.apply_processor_ops(customer, plan, idempotency_key).await {
            Ok(created) => created,
            Err(e) => {
                // The ledger transaction rolls back, but processor calls that
                // already landed are real. Queue the customer so the verifier
                // reconciles whatever partial state exists.
                self.queue_reconciliation(customer.id, idempotency_key, &e)
                    .await;
                self.mark_failed(customer.id, idempotency_key, &e).await;
                return Err(e);
            }
        };

        self.apply_ledger_mutations(tx, plan, &created).await?;

        let outcome = ExecutionOutcome {
            operation_id,
            transition: plan.transition,
            due_now_cents: plan.due_now_cents,
            replayed: false,
        };
        self.record_completed(tx, idempotency_key, &outcome).await?;

        if let Err(e) = self.cache.invalidate(customer.id).await {
            tracing::warn!(customer_id = %customer.id, error = %e, "Balance cache invalidation failed");
        }
        let event_type = match plan.transition {
            TransitionKind::NewAttach | TransitionKind::FreeToPaid | TransitionKind::Merge => {
                BillingEventType::ProductAttached
            }
            TransitionKind::Downgrade => BillingEventType::ProductSwitchScheduled,
            TransitionKind::Migration => BillingEventType::ProductMigrated,
            TransitionKind::Cancel => BillingEventType::ProductCanceled,
            _ => BillingEventType::ProductSwitched,
        };
        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(customer.id, event_type)
                    .data(serde_json::json!({
                        "operation_id": operation_id,
                        "transition": plan.transition,
                        "due_now_cents": plan.due_now_cents,
                        "next_cycle_cents": plan.next_cycle_cents,
                    }))
                    .actor(actor),
            )
            .await
        {
            tracing::warn!(customer_id = %customer.id, error = %e, "Failed to log billing event");
        }

        tracing::info!(
            customer_id = %customer.id,
            operation_id = %operation_id,
            transition = ?plan.transition,
            due_now_cents = plan.due_now_cents,
            processor_ops = plan.processor.len(),
            ledger_mutations = plan.ledger.len(),
            "Executed billing plan"
        );
        Ok(outcome)
    }

    /// Run the plan's processor calls in order, retrying transient failures.
    /// Returns subscription ids created for `CreateSubscription` ops, keyed by
    /// the attachment row that should receive them.
    async fn apply_processor_ops(
        &self,
        customer: &Customer,
        plan: &BillingPlan,
        idempotency_key: &str,
    ) -> BillingResult<Vec<(Uuid, String)>> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let processor_customer_id = match customer.processor_customer_id.as_deref() {
            Some(id) => id,
            None if plan.processor.is_empty() => return Ok(Vec::new()),
            None => {
                return Err(BillingError::Internal(format!(
                    "Customer {} has processor operations but no processor account",
                    customer.id
                )))
            }
        };

        let mut created = Vec::new();
        for (index, op) in plan.processor.iter().enumerate() {
            // Stable per-op key: a replay after a crash re-sends the same key
            // and the processor returns the original result
            let op_key = format!("{}:{}", idempotency_key, index);

            let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
                .max_delay(RETRY_MAX_DELAY)
                .take(MAX_RETRIES)
                .map(jitter);

            let result = Retry::spawn(retry_strategy, || async {
                let result = self
                    .processor
                    .apply_op(processor_customer_id, op, &op_key)
                    .await;
                match &result {
                    Ok(_) => Ok(result),
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(
                            customer_id = %customer.id,
                            op_index = index,
                            error = %e,
                            "Transient processor error - will retry"
                        );
                        Err(result)
                    }
                    Err(_) => Ok(result),
                }
            })
            .await
            .unwrap_or_else(|e| e)?;

            if let (ProcessorOp::CreateSubscription { customer_product_id, .. }, Some(state)) =
                (op, result)
            {
                created.push((*customer_product_id, state.subscription_id));
            }
        }
        Ok(created)
    }

    async fn apply_ledger_mutations(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan: &BillingPlan,
        created: &[(Uuid, String)],
    ) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        for mutation in &plan.ledger {
            match mutation {
                LedgerMutation::InsertProduct(row) => {
                    let mut row = row.clone();
                    if let Some((_, sub_id)) =
                        created.iter().find(|(product_id, _)| *product_id == row.id)
                    {
                        row.processor_subscription_id = Some(sub_id.clone());
                    }
                    self.ledger.insert_customer_product(tx, &row).await?;
                }
                LedgerMutation::InsertEntitlement(ent) => {
                    self.ledger.insert_entitlement(tx, ent).await?;
                }
                LedgerMutation::ExpireProduct {
                    customer_product_id,
                } => {
                    self.ledger
                        .expire_customer_product(tx, *customer_product_id, now)
                        .await?;
                }
                LedgerMutation::MarkCanceled {
                    customer_product_id,
                    at,
                } => {
                    self.ledger.mark_canceled(tx, *customer_product_id, *at).await?;
                }
                LedgerMutation::SetOptions {
                    customer_product_id,
                    options,
                } => {
                    self.ledger.set_options(tx, *customer_product_id, options).await?;
                }
                LedgerMutation::SetPrepaid {
                    entitlement_id,
                    prepaid_granted,
                    balance,
                } => {
                    self.ledger
                        .set_prepaid(tx, *entitlement_id, *prepaid_granted, *balance)
                        .await?;
                }
                LedgerMutation::SetReplaceables {
                    entitlement_id,
                    count,
                    expires_at,
                } => {
                    self.ledger
                        .set_replaceables(tx, *entitlement_id, *count, *expires_at)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn find_completed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        idempotency_key: &str,
    ) -> BillingResult<Option<ExecutionOutcome>> {
        let row: Option<OperationRow> = sqlx::query_as(
            "SELECT id, status, result FROM external_operations WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) if row.status == "completed" => match row.result {
                Some(result) => Ok(Some(result.0)),
                // Completed without a recorded result should not happen;
                // surface it rather than re-running processor calls
                None => Err(BillingError::Internal(format!(
                    "Operation {} completed without a result",
                    row.id
                ))),
            },
            _ => Ok(None),
        }
    }

    async fn record_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_id: CustomerId,
        plan: &BillingPlan,
        idempotency_key: &str,
    ) -> BillingResult<Uuid> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO external_operations (customer_id, idempotency_key, status, plan)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (idempotency_key)
            DO UPDATE SET attempts = external_operations.attempts + 1
            RETURNING id
            "#,
        )
        .bind(customer_id.0)
        .bind(idempotency_key)
        .bind(sqlx::types::Json(plan))
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.0)
    }

    async fn record_completed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        idempotency_key: &str,
        outcome: &ExecutionOutcome,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE external_operations
            SET status = 'completed', result = $2, completed_at = NOW()
            WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .bind(sqlx::types::Json(outcome))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Failure bookkeeping runs on the pool, not the transaction: the
    /// transaction (and the pending row recorded inside it) is about to roll
    /// back, so this upserts the failed row rather than updating it.
    async fn mark_failed(
        &self,
        customer_id: CustomerId,
        idempotency_key: &str,
        error: &BillingError,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO external_operations (customer_id, idempotency_key, status, error)
            VALUES ($1, $2, 'failed', $3)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET status = 'failed',
                error = EXCLUDED.error,
                attempts = external_operations.attempts + 1
            WHERE external_operations.status != 'completed'
            "#,
        )
        .bind(customer_id.0)
        .bind(idempotency_key)
        .bind(error.to_string())
        .execute(self.ledger.pool())
        .await;
        if let Err(e) = result {
            tracing::warn!(idempotency_key = %idempotency_key, error = %e, "Failed to mark operation failed");
        }
    }

    async fn queue_reconciliation(
        &self,
        customer_id: CustomerId,
        idempotency_key: &str,
        error: &BillingError,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO reconciliation_queue (customer_id, reason)
            VALUES ($1, $2)
            ON CONFLICT (customer_id) WHERE processed_at IS NULL DO NOTHING
            "#,
        )
        .bind(customer_id.0)
        .bind(format!("plan execution {} failed: {}", idempotency_key, error))
        .execute(self.ledger.pool())
        .await;

        match result {
            Ok(_) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    idempotency_key = %idempotency_key,
                    error = %error,
                    "Plan execution failed after processor calls started; customer queued for reconciliation"
                );
                if let Err(e) = self
                    .events
                    .log_event(
                        BillingEventBuilder::new(customer_id, BillingEventType::ReconciliationQueued)
                            .data(serde_json::json!({
                                "idempotency_key": idempotency_key,
                                "error": error.to_string(),
                            })),
                    )
                    .await
                {
                    tracing::warn!(customer_id = %customer_id, error = %e, "Failed to log reconciliation event");
                }
            }
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to queue reconciliation after processor failure"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryBalanceCache;
    use crate::processor::{ProcessorClient, ProcessorConfig};

    fn executor(pool: sqlx::PgPool) -> PlanExecutor {
        let processor = ProcessorClient::new(ProcessorConfig {
            secret_key: "sk_test_offline".to_string(),
            webhook_secret: "whsec_test".to_string(),
            app_base_url: "http://localhost:3000".to_string(),
        });
        PlanExecutor::new(
            LedgerService::new(pool.clone()),
            processor,
            BillingEventLogger::new(pool),
            std::sync::Arc::new(InMemoryBalanceCache::new()),
        )
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_first_attempt_failure_still_recorded() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = tally_shared::create_pool(&url).await.expect("pool");
        tally_shared::run_migrations(&pool).await.expect("migrations");

        let customer_id = CustomerId::new();
        sqlx::query("INSERT INTO customers (id, name) VALUES ($1, 'exec-test')")
            .bind(customer_id.0)
            .execute(&pool)
            .await
            .expect("insert customer");

        // The pending row a real execution writes rolls back with its
        // transaction, so mark_failed must not depend on it existing
        let exec = executor(pool.clone());
        let key = format!("exec-fail-{}", customer_id);
        exec.mark_failed(
            customer_id,
            &key,
            &BillingError::ProcessorTransient("timed out".to_string()),
        )
        .await;

        let row: (String, Option<String>) = sqlx::query_as(
            "SELECT status, error FROM external_operations WHERE idempotency_key = $1",
        )
        .bind(&key)
        .fetch_one(&pool)
        .await
        .expect("failed row");
        assert_eq!(row.0, "failed");
        assert!(row.1.expect("error recorded").contains("timed out"));
    }
}
