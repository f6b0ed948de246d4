//! Payment processor client
//!
//! The only module that talks to Stripe. Everything above it works with
//! `ProcessorSnapshot`/`ProcessorOp` values, so the rest of the crate never
//! sees a Stripe type. All calls run under a fixed timeout; mutating calls
//! carry an idempotency key supplied by the executor.

use std::collections::HashMap;
use std::time::Duration;

use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, CancellationDetails, CheckoutSession, CheckoutSessionMode,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCustomer, CreateInvoiceItem,
    CreateSubscription, CreateSubscriptionItems, Currency, CustomerId as StripeCustomerId,
    InvoiceItem, ListSubscriptions, Scheduled, Subscription, SubscriptionId, UpdateSubscription,
    UpdateSubscriptionCancellationDetails, UpdateSubscriptionItems,
};
use time::OffsetDateTime;

use crate::context::{ItemState, ProcessorSnapshot, SubscriptionState};
use crate::error::{BillingError, BillingResult};
use crate::ledger::Customer;
use crate::plan::{PlanItem, ProcessorOp};

/// Hard ceiling on any single processor call. A hung call here would hold the
/// per-customer lock for its whole duration.
const PROCESSOR_TIMEOUT: Duration = Duration::from_secs(15);

/// Comment written into `cancellation_details` on every cancellation the
/// engine initiates. A deletion webhook without this comment was triggered
/// from outside (dashboard, API key, failed-payment automation).
pub const INTERNAL_CANCELLATION_COMMENT: &str = "tally_engine_cancel";

fn internal_cancellation_details() -> CancellationDetails {
    CancellationDetails {
        comment: Some(INTERNAL_CANCELLATION_COMMENT.to_string()),
        ..Default::default()
    }
}

/// Configuration for the processor connection
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub app_base_url: String,
}

impl ProcessorConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }
}

/// Stripe-backed processor client
#[derive(Clone)]
pub struct ProcessorClient {
    client: stripe::Client,
    config: ProcessorConfig,
}

impl ProcessorClient {
    pub fn new(config: ProcessorConfig) -> Self {
        let client = stripe::Client::new(&config.secret_key);
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(ProcessorConfig::from_env()?))
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// A client that replays safely: Stripe dedupes on the idempotency key,
    /// so a retried call after a timeout cannot double-charge
    fn idempotent(&self, key: &str) -> stripe::Client {
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key.to_string()))
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, stripe::StripeError>>,
    ) -> BillingResult<T> {
        match tokio::time::timeout(PROCESSOR_TIMEOUT, fut).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => Err(BillingError::ProcessorTransient(
                "processor call exceeded timeout".to_string(),
            )),
        }
    }

    /// Fetch everything a plan computation needs in one pass.
    ///
    /// Failure here is `ProcessorUnhealthy`: with no trustworthy snapshot the
    /// whole mutation must abort rather than plan against stale state.
    pub async fn fetch_snapshot(
        &self,
        processor_customer_id: &str,
    ) -> BillingResult<ProcessorSnapshot> {
        let customer_id = parse_customer_id(processor_customer_id)?;

        let mut params = ListSubscriptions::new();
        params.customer = Some(customer_id);

        let list = match tokio::time::timeout(
            PROCESSOR_TIMEOUT,
            Subscription::list(&self.client, &params),
        )
        .await
        {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                return Err(BillingError::ProcessorUnhealthy(e.to_string()));
            }
            Err(_) => {
                return Err(BillingError::ProcessorUnhealthy(
                    "subscription list timed out".to_string(),
                ));
            }
        };

        Ok(ProcessorSnapshot {
            subscriptions: list.data.iter().map(subscription_state).collect(),
        })
    }

    /// Create the processor-side customer record, returning its id
    pub async fn create_customer(&self, customer: &Customer) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("customer_id".to_string(), customer.id.to_string());
        metadata.insert("env".to_string(), customer.env.to_string());

        let mut params = CreateCustomer::new();
        params.name = Some(&customer.name);
        params.metadata = Some(metadata);

        let created = self
            .bounded(stripe::Customer::create(&self.client, params))
            .await?;
        Ok(created.id.to_string())
    }

    /// Hosted checkout for attaches that need payment collection first.
    /// The attach targets travel in metadata and are replayed when the
    /// completion webhook arrives.
    pub async fn create_checkout_session(
        &self,
        processor_customer_id: &str,
        items: &[PlanItem],
        metadata: HashMap<String, String>,
    ) -> BillingResult<String> {
        let customer_id = parse_customer_id(processor_customer_id)?;

        let line_items = items
            .iter()
            .map(|item| CreateCheckoutSessionLineItems {
                price: Some(item.price_id.clone()),
                // Metered prices take no quantity; usage is reported later
                quantity: item.quantity.map(|q| q.max(0) as u64),
                ..Default::default()
            })
            .collect();

        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.config.app_base_url
        );
        let cancel_url = format!("{}/billing/cancel", self.config.app_base_url);

        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            ..Default::default()
        };

        let session = self
            .bounded(CheckoutSession::create(&self.client, params))
            .await?;
        session.url.ok_or_else(|| {
            BillingError::Internal("checkout session created without a URL".to_string())
        })
    }

    /// Apply one plan operation. Returns the created subscription state for
    /// `CreateSubscription`, `None` otherwise.
    pub async fn apply_op(
        &self,
        processor_customer_id: &str,
        op: &ProcessorOp,
        idempotency_key: &str,
    ) -> BillingResult<Option<SubscriptionState>> {
        let client = self.idempotent(idempotency_key);
        match op {
            ProcessorOp::CreateSubscription {
                items, trial_end, ..
            } => {
                let created = self
                    .create_subscription(&client, processor_customer_id, items, *trial_end)
                    .await?;
                Ok(Some(created))
            }
            ProcessorOp::AddItem {
                subscription_id,
                price_id,
                quantity,
            } => {
                let params = UpdateSubscription {
                    items: Some(vec![UpdateSubscriptionItems {
                        price: Some(price_id.clone()),
                        quantity: quantity.map(|q| q.max(0) as u64),
                        ..Default::default()
                    }]),
                    proration_behavior: Some(SubscriptionProrationBehavior::None),
                    ..Default::default()
                };
                self.update_subscription(&client, subscription_id, params)
                    .await?;
                Ok(None)
            }
            ProcessorOp::SetItemQuantity {
                subscription_id,
                item_id,
                quantity,
            } => {
                let params = UpdateSubscription {
                    items: Some(vec![UpdateSubscriptionItems {
                        id: Some(item_id.clone()),
                        quantity: Some((*quantity).max(0) as u64),
                        ..Default::default()
                    }]),
                    proration_behavior: Some(SubscriptionProrationBehavior::None),
                    ..Default::default()
                };
                self.update_subscription(&client, subscription_id, params)
                    .await?;
                Ok(None)
            }
            ProcessorOp::RemoveItem {
                subscription_id,
                item_id,
            } => {
                let params = UpdateSubscription {
                    items: Some(vec![UpdateSubscriptionItems {
                        id: Some(item_id.clone()),
                        deleted: Some(true),
                        ..Default::default()
                    }]),
                    proration_behavior: Some(SubscriptionProrationBehavior::None),
                    ..Default::default()
                };
                self.update_subscription(&client, subscription_id, params)
                    .await?;
                Ok(None)
            }
            ProcessorOp::InvoiceLine {
                amount_cents,
                description,
            } => {
                let customer_id = parse_customer_id(processor_customer_id)?;
                let mut params = CreateInvoiceItem::new(customer_id);
                params.amount = Some(*amount_cents);
                params.currency = Some(Currency::USD);
                params.description = Some(description);
                self.bounded(InvoiceItem::create(&client, params)).await?;
                Ok(None)
            }
            ProcessorOp::SchedulePhase {
                subscription_id,
                starts_at,
                items,
            } => {
                // The scheduled ledger row is authoritative; the worker applies
                // the item swap when the boundary arrives. Mark the pending
                // phase in metadata so processor-side state is inspectable.
                let mut metadata = HashMap::new();
                metadata.insert(
                    "pending_phase_at".to_string(),
                    starts_at.unix_timestamp().to_string(),
                );
                metadata.insert(
                    "pending_phase_items".to_string(),
                    serde_json::to_string(items)
                        .map_err(|e| BillingError::Internal(e.to_string()))?,
                );
                let params = UpdateSubscription {
                    metadata: Some(metadata),
                    ..Default::default()
                };
                self.update_subscription(&client, subscription_id, params)
                    .await?;
                Ok(None)
            }
            ProcessorOp::EndTrialNow { subscription_id } => {
                let params = UpdateSubscription {
                    trial_end: Some(Scheduled::now()),
                    proration_behavior: Some(SubscriptionProrationBehavior::None),
                    ..Default::default()
                };
                self.update_subscription(&client, subscription_id, params)
                    .await?;
                Ok(None)
            }
            ProcessorOp::CancelAtPeriodEnd { subscription_id } => {
                let params = UpdateSubscription {
                    cancel_at_period_end: Some(true),
                    cancellation_details: Some(UpdateSubscriptionCancellationDetails {
                        comment: Some(INTERNAL_CANCELLATION_COMMENT.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                self.update_subscription(&client, subscription_id, params)
                    .await?;
                Ok(None)
            }
            ProcessorOp::CancelNow { subscription_id } => {
                let sub_id = parse_subscription_id(subscription_id)?;
                let params = CancelSubscription {
                    cancellation_details: Some(internal_cancellation_details()),
                    invoice_now: None,
                    prorate: None,
                };
                self.bounded(Subscription::cancel(&client, &sub_id, params))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn create_subscription(
        &self,
        client: &stripe::Client,
        processor_customer_id: &str,
        items: &[PlanItem],
        trial_end: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionState> {
        let customer_id = parse_customer_id(processor_customer_id)?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(
            items
                .iter()
                .map(|item| CreateSubscriptionItems {
                    price: Some(item.price_id.clone()),
                    quantity: item.quantity.map(|q| q.max(0) as u64),
                    ..Default::default()
                })
                .collect(),
        );
        if let Some(trial_end) = trial_end {
            params.trial_end = Some(Scheduled::at(trial_end.unix_timestamp()));
        }

        let subscription = self.bounded(Subscription::create(client, params)).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            customer = %processor_customer_id,
            items = items.len(),
            "Created subscription"
        );
        Ok(subscription_state(&subscription))
    }

    async fn update_subscription(
        &self,
        client: &stripe::Client,
        subscription_id: &str,
        params: UpdateSubscription<'_>,
    ) -> BillingResult<Subscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        self.bounded(Subscription::update(client, &sub_id, params))
            .await
    }
}

fn parse_customer_id(id: &str) -> BillingResult<StripeCustomerId> {
    id.parse::<StripeCustomerId>()
        .map_err(|e| BillingError::Internal(format!("Invalid processor customer id: {}", e)))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::Internal(format!("Invalid subscription id: {}", e)))
}

fn subscription_state(sub: &Subscription) -> SubscriptionState {
    SubscriptionState {
        subscription_id: sub.id.to_string(),
        status: sub.status.as_str().to_string(),
        period_start: OffsetDateTime::from_unix_timestamp(sub.current_period_start)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        period_end: OffsetDateTime::from_unix_timestamp(sub.current_period_end)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        cancel_at_period_end: sub.cancel_at_period_end,
        schedule_id: sub.schedule.as_ref().map(|s| match s {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(schedule) => schedule.id.to_string(),
        }),
        items: sub
            .items
            .data
            .iter()
            .map(|item| ItemState {
                item_id: item.id.to_string(),
                price_id: item
                    .price
                    .as_ref()
                    .map(|p| p.id.to_string())
                    .unwrap_or_default(),
                quantity: item.quantity.map(|q| q as i64),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_cancellation_carries_sentinel() {
        let details = internal_cancellation_details();
        assert_eq!(
            details.comment.as_deref(),
            Some(INTERNAL_CANCELLATION_COMMENT)
        );
    }
}
