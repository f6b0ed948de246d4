//! Billing context
//!
//! A `BillingContext` is the immutable snapshot every plan computation works
//! from: the customer's full ledger graph, the processor's subscription state
//! (fetched exactly once, never re-fetched mid-computation) and the resolved
//! target products. Each pipeline stage derives new values from it; nothing
//! downstream mutates it.

use serde::{Deserialize, Serialize};
use tally_shared::{CustomerId, EntityId};
use time::OffsetDateTime;

use crate::catalog::{CatalogService, Product};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Customer, CustomerEntitlement, CustomerProduct, FeatureOptions, LedgerService};
use crate::processor::ProcessorClient;

/// One subscription item as the processor currently has it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    pub item_id: String,
    pub price_id: String,
    pub quantity: Option<i64>,
}

/// One subscription as the processor currently has it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub subscription_id: String,
    pub status: String,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub schedule_id: Option<String>,
    pub items: Vec<ItemState>,
}

/// Everything fetched from the processor in one pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorSnapshot {
    pub subscriptions: Vec<SubscriptionState>,
}

impl ProcessorSnapshot {
    pub fn subscription(&self, subscription_id: &str) -> Option<&SubscriptionState> {
        self.subscriptions
            .iter()
            .find(|s| s.subscription_id == subscription_id)
    }
}

/// A product the caller wants attached, before catalog resolution.
/// Serialized into checkout session metadata and replayed on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachTarget {
    pub product_id: String,
    /// Pin a specific catalog version (migrations); latest otherwise
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(default)]
    pub options: Vec<FeatureOptions>,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
}

/// A resolved target: catalog definition plus chosen options
#[derive(Debug, Clone)]
pub struct TargetProduct {
    pub product: Product,
    pub options: Vec<FeatureOptions>,
    pub entity_id: Option<EntityId>,
}

/// Snapshot of everything a plan computation may read
#[derive(Debug, Clone)]
pub struct BillingContext {
    pub customer: Customer,
    pub now: OffsetDateTime,
    /// Non-expired attachments, oldest first
    pub products: Vec<CustomerProduct>,
    /// Catalog definitions for `products`, resolved at their pinned versions
    pub attached_defs: Vec<Product>,
    /// Entitlements owned by live attachments
    pub entitlements: Vec<CustomerEntitlement>,
    pub processor: ProcessorSnapshot,
    pub targets: Vec<TargetProduct>,
}

impl BillingContext {
    /// The live attachment a new product in `group` would displace
    pub fn current_in_group(
        &self,
        group: Option<&str>,
        entity_id: Option<EntityId>,
    ) -> Option<&CustomerProduct> {
        self.products.iter().find(|p| {
            p.status.is_live()
                && !p.is_add_on
                && p.product_group.as_deref() == group
                && p.entity_id == entity_id
        })
    }

    pub fn attached_def(&self, product: &CustomerProduct) -> Option<&Product> {
        self.attached_defs
            .iter()
            .find(|d| d.id == product.product_id && d.version == product.product_version)
    }

    pub fn entitlements_of(&self, customer_product_id: uuid::Uuid) -> Vec<&CustomerEntitlement> {
        self.entitlements
            .iter()
            .filter(|e| e.customer_product_id == customer_product_id)
            .collect()
    }

    /// The subscription state backing an attachment, if any
    pub fn subscription_of(&self, product: &CustomerProduct) -> Option<&SubscriptionState> {
        product
            .processor_subscription_id
            .as_deref()
            .and_then(|id| self.processor.subscription(id))
    }
}

/// Builds a `BillingContext` for one mutating request.
///
/// The per-customer advisory lock must already be held by the caller: the
/// ledger read here and the executor's later write are only atomic against a
/// concurrent second mutation because both happen under that lock.
#[derive(Clone)]
pub struct BillingContextBuilder {
    ledger: LedgerService,
    catalog: CatalogService,
    processor: ProcessorClient,
}

impl BillingContextBuilder {
    pub fn new(ledger: LedgerService, catalog: CatalogService, processor: ProcessorClient) -> Self {
        Self {
            ledger,
            catalog,
            processor,
        }
    }

    pub async fn build(
        &self,
        customer_id: CustomerId,
        targets: &[AttachTarget],
        now: OffsetDateTime,
    ) -> BillingResult<BillingContext> {
        let customer = self.ledger.get_customer(customer_id).await?;

        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(entity_id) = target.entity_id {
                if !self.ledger.entity_exists(customer_id, entity_id).await? {
                    return Err(BillingError::NotFound(format!(
                        "Entity {} not found for customer {}",
                        entity_id, customer_id
                    )));
                }
            }
            let product = match target.version {
                Some(version) => {
                    self.catalog
                        .get_product_version(&target.product_id, version)
                        .await?
                }
                None => self.catalog.get_product(&target.product_id).await?,
            };
            resolved.push(TargetProduct {
                product,
                options: target.options.clone(),
                entity_id: target.entity_id,
            });
        }

        let products = self.ledger.customer_products(customer_id).await?;
        let entitlements = self.ledger.live_entitlements(customer_id).await?;

        let mut attached_defs = Vec::with_capacity(products.len());
        for product in &products {
            let def = self
                .catalog
                .get_product_version(&product.product_id, product.product_version)
                .await?;
            attached_defs.push(def);
        }

        // One snapshot per request; a torn read here would make the plan diff
        // against state that no longer exists
        let processor = match customer.processor_customer_id.as_deref() {
            Some(processor_customer_id) => {
                self.processor.fetch_snapshot(processor_customer_id).await?
            }
            None => ProcessorSnapshot::default(),
        };

        Ok(BillingContext {
            customer,
            now,
            products,
            attached_defs,
            entitlements,
            processor,
            targets: resolved,
        })
    }
}
