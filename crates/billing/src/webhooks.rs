//! Processor webhook handling
//!
//! Verifies, deduplicates and applies processor events. Payloads are
//! converted once, at this boundary, into the engine's own `BillingEvent`
//! variants; the handlers (and everything behind them) never see a Stripe
//! type. Status changes flow from the processor into the ledger here
//! (payment failures, renewals, externally-triggered cancellations);
//! checkout completions replay the attach targets carried in session
//! metadata through the normal plan pipeline.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Expandable, Invoice, Subscription};
use tally_shared::CustomerId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::BalanceCache;
use crate::context::{AttachTarget, BillingContextBuilder};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::executor::PlanExecutor;
use crate::ledger::{CustomerProductStatus, LedgerService};
use crate::plan::{compute_plan, BillingBehavior, PlanTiming};
use crate::processor::INTERNAL_CANCELLATION_COMMENT;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload before it is rejected as a replay
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `t=...,v1=...` signature header against the payload.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// The engine's view of a processor notification. Closed set: anything the
/// engine does not act on never becomes a variant.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    SubscriptionUpdated {
        processor_customer_id: String,
        subscription_id: String,
        status: Option<CustomerProductStatus>,
        raw_status: String,
        cancel_at_period_end: bool,
    },
    SubscriptionDeleted {
        processor_customer_id: String,
        subscription_id: String,
        /// True when the deletion did not carry the engine's cancellation
        /// sentinel, meaning someone canceled from outside the engine
        external: bool,
    },
    InvoicePaid {
        processor_customer_id: String,
        subscription_id: Option<String>,
        amount_paid_cents: i64,
    },
    InvoiceFailed {
        processor_customer_id: String,
        subscription_id: Option<String>,
        amount_due_cents: i64,
    },
    CheckoutCompleted {
        session_id: String,
        customer_id: CustomerId,
        targets: Vec<AttachTarget>,
    },
}

impl BillingEvent {
    /// Convert a verified processor event. `None` means the engine has no
    /// handler for this event type.
    pub fn from_processor(event: &Event) -> BillingResult<Option<Self>> {
        match event.type_ {
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                let sub = extract_subscription(event)?;
                Ok(Some(BillingEvent::SubscriptionUpdated {
                    processor_customer_id: expandable_customer_id(&sub.customer),
                    subscription_id: sub.id.to_string(),
                    status: map_subscription_status(sub.status.as_str()),
                    raw_status: sub.status.as_str().to_string(),
                    cancel_at_period_end: sub.cancel_at_period_end,
                }))
            }
            EventType::CustomerSubscriptionDeleted => {
                let sub = extract_subscription(event)?;
                let comment = sub
                    .cancellation_details
                    .as_ref()
                    .and_then(|details| details.comment.as_deref());
                Ok(Some(BillingEvent::SubscriptionDeleted {
                    processor_customer_id: expandable_customer_id(&sub.customer),
                    subscription_id: sub.id.to_string(),
                    external: external_cancellation(comment),
                }))
            }
            EventType::InvoicePaid => {
                let invoice = extract_invoice(event)?;
                Ok(invoice.customer.as_ref().map(|customer| {
                    BillingEvent::InvoicePaid {
                        processor_customer_id: expandable_customer_id(customer),
                        subscription_id: invoice_subscription_id(&invoice),
                        amount_paid_cents: invoice.amount_paid.unwrap_or(0),
                    }
                }))
            }
            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event)?;
                Ok(invoice.customer.as_ref().map(|customer| {
                    BillingEvent::InvoiceFailed {
                        processor_customer_id: expandable_customer_id(customer),
                        subscription_id: invoice_subscription_id(&invoice),
                        amount_due_cents: invoice.amount_due.unwrap_or(0),
                    }
                }))
            }
            EventType::CheckoutSessionCompleted => {
                let session = match &event.data.object {
                    EventObject::CheckoutSession(session) => session.clone(),
                    _ => {
                        return Err(BillingError::Internal(
                            "checkout event without a session object".to_string(),
                        ))
                    }
                };
                let metadata: HashMap<String, String> =
                    session.metadata.clone().unwrap_or_default();
                let customer_id = metadata
                    .get("customer_id")
                    .and_then(|raw| Uuid::from_str(raw).ok())
                    .map(CustomerId)
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "Checkout session {} has no customer_id in metadata",
                            session.id
                        ))
                    })?;
                let targets: Vec<AttachTarget> = metadata
                    .get("targets")
                    .map(|raw| serde_json::from_str(raw))
                    .transpose()
                    .map_err(|e| {
                        BillingError::Internal(format!(
                            "Checkout session {} has malformed targets: {}",
                            session.id, e
                        ))
                    })?
                    .unwrap_or_default();
                Ok(Some(BillingEvent::CheckoutCompleted {
                    session_id: session.id.to_string(),
                    customer_id,
                    targets,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// A deletion without the engine's sentinel comment was initiated outside
/// the engine.
pub fn external_cancellation(cancellation_comment: Option<&str>) -> bool {
    cancellation_comment != Some(INTERNAL_CANCELLATION_COMMENT)
}

/// Verifies and applies processor webhook events
#[derive(Clone)]
pub struct WebhookHandler {
    ledger: LedgerService,
    context: BillingContextBuilder,
    executor: PlanExecutor,
    events: BillingEventLogger,
    cache: Arc<dyn BalanceCache>,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        ledger: LedgerService,
        context: BillingContextBuilder,
        executor: PlanExecutor,
        events: BillingEventLogger,
        cache: Arc<dyn BalanceCache>,
        webhook_secret: String,
    ) -> Self {
        Self {
            ledger,
            context,
            executor,
            events,
            cache,
            webhook_secret,
        }
    }

    /// Verify the signature and parse the event envelope.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let now_unix = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, now_unix)?;
        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(error = %e, "Failed to parse verified webhook payload");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Apply a verified event. Duplicate deliveries are acknowledged without
    /// re-applying; the claim insert is atomic, so two concurrent deliveries
    /// of the same event cannot both process it.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processor_webhook_events (processor_event_id, event_type, status)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (processor_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(event.type_.to_string())
        .fetch_optional(self.ledger.pool())
        .await?;

        if claimed.is_none() {
            tracing::info!(event_id = %event_id, "Duplicate webhook delivery - already claimed");
            return Ok(());
        }

        let result = match BillingEvent::from_processor(&event) {
            Ok(Some(converted)) => self.apply(&event_id, converted).await,
            Ok(None) => {
                tracing::debug!(
                    event_type = %event.type_,
                    event_id = %event_id,
                    "No handler for event type"
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        let (status, error) = match &result {
            Ok(()) => ("processed", None),
            Err(e) => ("failed", Some(e.to_string())),
        };
        if let Err(e) = sqlx::query(
            r#"
            UPDATE processor_webhook_events
            SET status = $2, error = $3, processed_at = NOW()
            WHERE processor_event_id = $1
            "#,
        )
        .bind(&event_id)
        .bind(status)
        .bind(&error)
        .execute(self.ledger.pool())
        .await
        {
            tracing::error!(event_id = %event_id, error = %e, "Failed to record webhook result");
        }

        result
    }

    async fn apply(&self, processor_event_id: &str, event: BillingEvent) -> BillingResult<()> {
        match event {
            BillingEvent::SubscriptionUpdated {
                processor_customer_id,
                subscription_id,
                status,
                raw_status,
                cancel_at_period_end,
            } => {
                self.apply_subscription_updated(
                    processor_event_id,
                    &processor_customer_id,
                    &subscription_id,
                    status,
                    &raw_status,
                    cancel_at_period_end,
                )
                .await
            }
            BillingEvent::SubscriptionDeleted {
                processor_customer_id,
                subscription_id,
                external,
            } => {
                self.apply_subscription_deleted(
                    processor_event_id,
                    &processor_customer_id,
                    &subscription_id,
                    external,
                )
                .await
            }
            BillingEvent::InvoicePaid {
                processor_customer_id,
                subscription_id,
                amount_paid_cents,
            } => {
                self.apply_invoice_paid(
                    processor_event_id,
                    &processor_customer_id,
                    subscription_id.as_deref(),
                    amount_paid_cents,
                )
                .await
            }
            BillingEvent::InvoiceFailed {
                processor_customer_id,
                subscription_id,
                amount_due_cents,
            } => {
                self.apply_invoice_failed(
                    processor_event_id,
                    &processor_customer_id,
                    subscription_id.as_deref(),
                    amount_due_cents,
                )
                .await
            }
            BillingEvent::CheckoutCompleted {
                session_id,
                customer_id,
                targets,
            } => {
                self.apply_checkout_completed(processor_event_id, &session_id, customer_id, targets)
                    .await
            }
        }
    }

    async fn apply_subscription_updated(
        &self,
        processor_event_id: &str,
        processor_customer_id: &str,
        subscription_id: &str,
        status: Option<CustomerProductStatus>,
        raw_status: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<()> {
        let customer_id = self.resolve_customer(processor_customer_id).await?;

        if let Some(status) = status {
            // Scheduled rows wait for their phase; expired rows stay expired
            sqlx::query(
                r#"
                UPDATE customer_products
                SET status = $2
                WHERE processor_subscription_id = $1
                  AND status IN ('trialing', 'active', 'past_due')
                  AND status != $2
                "#,
            )
            .bind(subscription_id)
            .bind(status.to_string())
            .execute(self.ledger.pool())
            .await?;
            self.invalidate(customer_id).await;
        }

        self.log(
            BillingEventBuilder::new(customer_id, BillingEventType::SubscriptionUpdated)
                .data(serde_json::json!({
                    "status": raw_status,
                    "cancel_at_period_end": cancel_at_period_end,
                }))
                .processor_event(processor_event_id)
                .processor_subscription(subscription_id)
                .actor(ActorType::Processor),
        )
        .await;

        if raw_status == "past_due" {
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Subscription is past due"
            );
        }
        Ok(())
    }

    async fn apply_subscription_deleted(
        &self,
        processor_event_id: &str,
        processor_customer_id: &str,
        subscription_id: &str,
        external: bool,
    ) -> BillingResult<()> {
        let customer_id = self.resolve_customer(processor_customer_id).await?;

        sqlx::query(
            r#"
            UPDATE customer_products
            SET status = 'expired', ended_at = NOW()
            WHERE processor_subscription_id = $1 AND status != 'expired'
            "#,
        )
        .bind(subscription_id)
        .execute(self.ledger.pool())
        .await?;
        self.invalidate(customer_id).await;

        if external {
            // The ledger never asked for this. Expire what the subscription
            // carried, then queue the customer so the verifier records
            // whatever else no longer lines up.
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Externally-initiated cancellation; attachments expired"
            );
            if let Err(e) = sqlx::query(
                r#"
                INSERT INTO reconciliation_queue (customer_id, reason)
                VALUES ($1, $2)
                ON CONFLICT (customer_id) WHERE processed_at IS NULL DO NOTHING
                "#,
            )
            .bind(customer_id.0)
            .bind(format!(
                "subscription {} canceled outside the engine",
                subscription_id
            ))
            .execute(self.ledger.pool())
            .await
            {
                tracing::error!(customer_id = %customer_id, error = %e, "Failed to queue reconciliation");
            }
        } else {
            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Subscription deleted; attachments expired"
            );
        }

        self.log(
            BillingEventBuilder::new(customer_id, BillingEventType::SubscriptionCanceled)
                .data(serde_json::json!({ "external": external }))
                .processor_event(processor_event_id)
                .processor_subscription(subscription_id)
                .actor(ActorType::Processor),
        )
        .await;
        Ok(())
    }

    async fn apply_invoice_paid(
        &self,
        processor_event_id: &str,
        processor_customer_id: &str,
        subscription_id: Option<&str>,
        amount_paid_cents: i64,
    ) -> BillingResult<()> {
        let customer_id = self.resolve_customer(processor_customer_id).await?;

        if let Some(subscription_id) = subscription_id {
            sqlx::query(
                r#"
                UPDATE customer_products
                SET status = 'active'
                WHERE processor_subscription_id = $1 AND status = 'past_due'
                "#,
            )
            .bind(subscription_id)
            .execute(self.ledger.pool())
            .await?;
            self.invalidate(customer_id).await;
        }

        self.log(
            BillingEventBuilder::new(customer_id, BillingEventType::InvoicePaid)
                .data(serde_json::json!({
                    "amount_paid": amount_paid_cents,
                }))
                .processor_event(processor_event_id)
                .actor(ActorType::Processor),
        )
        .await;
        Ok(())
    }

    async fn apply_invoice_failed(
        &self,
        processor_event_id: &str,
        processor_customer_id: &str,
        subscription_id: Option<&str>,
        amount_due_cents: i64,
    ) -> BillingResult<()> {
        let customer_id = self.resolve_customer(processor_customer_id).await?;

        if let Some(subscription_id) = subscription_id {
            sqlx::query(
                r#"
                UPDATE customer_products
                SET status = 'past_due'
                WHERE processor_subscription_id = $1 AND status IN ('trialing', 'active')
                "#,
            )
            .bind(subscription_id)
            .execute(self.ledger.pool())
            .await?;
            self.invalidate(customer_id).await;
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Invoice payment failed; attachments marked past due"
            );
        }

        self.log(
            BillingEventBuilder::new(customer_id, BillingEventType::InvoiceFailed)
                .data(serde_json::json!({
                    "amount_due": amount_due_cents,
                }))
                .processor_event(processor_event_id)
                .actor(ActorType::Processor),
        )
        .await;
        Ok(())
    }

    /// Completes a checkout-gated attach: the targets the customer paid for
    /// travel in session metadata and run through the normal plan pipeline,
    /// keyed by the session id so redelivery cannot attach twice.
    async fn apply_checkout_completed(
        &self,
        processor_event_id: &str,
        session_id: &str,
        customer_id: CustomerId,
        targets: Vec<AttachTarget>,
    ) -> BillingResult<()> {
        if targets.is_empty() {
            tracing::info!(session_id = %session_id, "Checkout session carries no attach targets");
            return Ok(());
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self.executor.begin_locked(customer_id).await?;
        let ctx = self.context.build(customer_id, &targets, now).await?;
        let plan = compute_plan(&ctx, BillingBehavior::default(), PlanTiming::default())?;
        let outcome = self
            .executor
            .execute(
                &mut tx,
                &ctx.customer,
                &plan,
                &format!("checkout:{}", session_id),
                ActorType::Processor,
            )
            .await?;
        tx.commit().await?;

        self.log(
            BillingEventBuilder::new(customer_id, BillingEventType::CheckoutCompleted)
                .data(serde_json::json!({
                    "session_id": session_id,
                    "operation_id": outcome.operation_id,
                    "replayed": outcome.replayed,
                }))
                .processor_event(processor_event_id)
                .actor(ActorType::Processor),
        )
        .await;

        tracing::info!(
            customer_id = %customer_id,
            session_id = %session_id,
            operation_id = %outcome.operation_id,
            "Checkout completed and products attached"
        );
        Ok(())
    }

    async fn resolve_customer(&self, processor_customer_id: &str) -> BillingResult<CustomerId> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM customers WHERE processor_customer_id = $1")
                .bind(processor_customer_id)
                .fetch_optional(self.ledger.pool())
                .await?;
        row.map(|r| CustomerId(r.0)).ok_or_else(|| {
            BillingError::NotFound(format!(
                "No customer for processor account {}",
                processor_customer_id
            ))
        })
    }

    async fn invalidate(&self, customer_id: CustomerId) {
        if let Err(e) = self.cache.invalidate(customer_id).await {
            tracing::warn!(customer_id = %customer_id, error = %e, "Balance cache invalidation failed");
        }
    }

    async fn log(&self, builder: BillingEventBuilder) {
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log webhook billing event");
        }
    }
}

fn extract_subscription(event: &Event) -> BillingResult<Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        _ => Err(BillingError::Internal(format!(
            "Event {} carries no subscription object",
            event.id
        ))),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        _ => Err(BillingError::Internal(format!(
            "Event {} carries no invoice object",
            event.id
        ))),
    }
}

fn expandable_customer_id(customer: &Expandable<stripe::Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    }
}

fn invoice_subscription_id(invoice: &Invoice) -> Option<String> {
    invoice.subscription.as_ref().map(|s| match s {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(sub) => sub.id.to_string(),
    })
}

fn map_subscription_status(status: &str) -> Option<CustomerProductStatus> {
    match status {
        "trialing" => Some(CustomerProductStatus::Trialing),
        "active" => Some(CustomerProductStatus::Active),
        "past_due" | "unpaid" => Some(CustomerProductStatus::PastDue),
        "canceled" | "incomplete_expired" => Some(CustomerProductStatus::Expired),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("hmac key");
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000, "whsec_testsecret");
        assert!(verify_signature(payload, &header, "whsec_testsecret", 1_700_000_000).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000, "whsec_other");
        assert!(matches!(
            verify_signature(payload, &header, "whsec_testsecret", 1_700_000_000),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000, "whsec_testsecret");
        assert!(verify_signature(
            r#"{"id":"evt_2"}"#,
            &header,
            "whsec_testsecret",
            1_700_000_000
        )
        .is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000, "whsec_testsecret");
        let later = 1_700_000_000 + SIGNATURE_TOLERANCE_SECS + 1;
        assert!(verify_signature(payload, &header, "whsec_testsecret", later).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature("{}", "garbage", "whsec_testsecret", 1_700_000_000).is_err());
        assert!(verify_signature("{}", "t=abc,v1=", "whsec_testsecret", 1_700_000_000).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_subscription_status("active"),
            Some(CustomerProductStatus::Active)
        );
        assert_eq!(
            map_subscription_status("unpaid"),
            Some(CustomerProductStatus::PastDue)
        );
        assert_eq!(map_subscription_status("incomplete"), None);
    }

    #[test]
    fn test_engine_cancellation_is_not_external() {
        assert!(!external_cancellation(Some(INTERNAL_CANCELLATION_COMMENT)));
    }

    #[test]
    fn test_dashboard_cancellation_is_external() {
        // No details at all, and a human-written comment, both count
        assert!(external_cancellation(None));
        assert!(external_cancellation(Some("customer requested downgrade")));
    }
}
