//! Billing event log
//!
//! Append-only audit trail for every billing mutation. Events answer "why is
//! this customer on this product?" after the fact and feed the consistency
//! verifier's anomaly reports.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tally_shared::CustomerId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Attachment lifecycle
    ProductAttached,
    ProductSwitched,
    ProductSwitchScheduled,
    ProductCanceled,
    ProductExpired,
    ProductMigrated,
    TrialStarted,
    TrialEnded,

    // Balances
    UsageRecorded,
    BalanceAdjusted,
    BalanceReset,

    // Processor
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    InvoicePaid,
    InvoiceFailed,
    CheckoutCompleted,

    // Verification
    ConsistencyAnomaly,
    ReconciliationQueued,

    // Customer lifecycle
    CustomerCreated,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::ProductAttached => "PRODUCT_ATTACHED",
            BillingEventType::ProductSwitched => "PRODUCT_SWITCHED",
            BillingEventType::ProductSwitchScheduled => "PRODUCT_SWITCH_SCHEDULED",
            BillingEventType::ProductCanceled => "PRODUCT_CANCELED",
            BillingEventType::ProductExpired => "PRODUCT_EXPIRED",
            BillingEventType::ProductMigrated => "PRODUCT_MIGRATED",
            BillingEventType::TrialStarted => "TRIAL_STARTED",
            BillingEventType::TrialEnded => "TRIAL_ENDED",
            BillingEventType::UsageRecorded => "USAGE_RECORDED",
            BillingEventType::BalanceAdjusted => "BALANCE_ADJUSTED",
            BillingEventType::BalanceReset => "BALANCE_RESET",
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::InvoiceFailed => "INVOICE_FAILED",
            BillingEventType::CheckoutCompleted => "CHECKOUT_COMPLETED",
            BillingEventType::ConsistencyAnomaly => "CONSISTENCY_ANOMALY",
            BillingEventType::ReconciliationQueued => "RECONCILIATION_QUEUED",
            BillingEventType::CustomerCreated => "CUSTOMER_CREATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// API caller
    Api,
    /// System automation (worker sweeps)
    System,
    /// Processor webhook
    Processor,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Api => write!(f, "api"),
            ActorType::System => write!(f, "system"),
            ActorType::Processor => write!(f, "processor"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEventRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processor_event_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for billing events
pub struct BillingEventBuilder {
    customer_id: CustomerId,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    processor_event_id: Option<String>,
    processor_subscription_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(customer_id: CustomerId, event_type: BillingEventType) -> Self {
        Self {
            customer_id,
            event_type,
            event_data: serde_json::json!({}),
            processor_event_id: None,
            processor_subscription_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn processor_event(mut self, event_id: impl Into<String>) -> Self {
        self.processor_event_id = Some(event_id.into());
        self
    }

    pub fn processor_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.processor_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Appends and queries billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                customer_id, event_type, event_data,
                processor_event_id, processor_subscription_id, actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(builder.customer_id.0)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.processor_event_id)
        .bind(&builder.processor_subscription_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    pub async fn events_for_customer(
        &self,
        customer_id: CustomerId,
        limit: i64,
    ) -> BillingResult<Vec<BillingEventRecord>> {
        let events: Vec<BillingEventRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, event_type, event_data,
                   processor_event_id, processor_subscription_id, actor_type, created_at
            FROM billing_events
            WHERE customer_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(customer_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Whether a processor webhook event was already applied (dedup on replay)
    pub async fn processor_event_seen(&self, processor_event_id: &str) -> BillingResult<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM billing_events WHERE processor_event_id = $1 LIMIT 1")
                .bind(processor_event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}
