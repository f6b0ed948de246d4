//! Customer ledger
//!
//! Row types and persistence for what a customer actually has: attached
//! products (`CustomerProduct`), live feature grants (`CustomerEntitlement`)
//! and their rollover entries. The ledger is mutated only by the plan
//! executor and the usage deduction path, both inside row-scoped
//! transactions.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tally_shared::{AppEnv, CustomerId, EntityId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::BillingInterval;
use crate::error::{BillingError, BillingResult};

/// Lifecycle of one product attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerProductStatus {
    /// Written now, starts at a future phase boundary (deferred downgrade)
    Scheduled,
    Trialing,
    Active,
    PastDue,
    Expired,
}

impl CustomerProductStatus {
    /// Statuses that grant entitlements right now
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CustomerProductStatus::Trialing
                | CustomerProductStatus::Active
                | CustomerProductStatus::PastDue
        )
    }
}

impl std::fmt::Display for CustomerProductStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CustomerProductStatus::Scheduled => "scheduled",
            CustomerProductStatus::Trialing => "trialing",
            CustomerProductStatus::Active => "active",
            CustomerProductStatus::PastDue => "past_due",
            CustomerProductStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CustomerProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(CustomerProductStatus::Scheduled),
            "trialing" => Ok(CustomerProductStatus::Trialing),
            "active" => Ok(CustomerProductStatus::Active),
            "past_due" => Ok(CustomerProductStatus::PastDue),
            "expired" => Ok(CustomerProductStatus::Expired),
            other => Err(format!("unknown customer product status: {}", other)),
        }
    }
}

/// Per-feature option chosen at attach time (prepaid quantity, seat count)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOptions {
    pub feature_id: String,
    pub quantity: i64,
}

/// A customer row
#[derive(Debug, Clone)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    pub env: AppEnv,
    pub processor_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Customer {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let env: String = row.try_get("env")?;
        Ok(Self {
            id: CustomerId(row.try_get("id")?),
            name: row.try_get("name")?,
            env: env.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            processor_customer_id: row.try_get("processor_customer_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// One attachment of a product to a customer (optionally scoped to an entity)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProduct {
    pub id: Uuid,
    pub customer_id: CustomerId,
    pub product_id: String,
    pub product_version: i32,
    pub product_group: Option<String>,
    pub is_add_on: bool,
    pub entity_id: Option<EntityId>,
    pub status: CustomerProductStatus,
    pub started_at: OffsetDateTime,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub processor_subscription_id: Option<String>,
    pub processor_schedule_id: Option<String>,
    pub options: Vec<FeatureOptions>,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CustomerProduct {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let status: String = row.try_get("status")?;
        let options: Json<Vec<FeatureOptions>> = row.try_get("options")?;
        let entity_id: Option<Uuid> = row.try_get("entity_id")?;
        Ok(Self {
            id: row.try_get("id")?,
            customer_id: CustomerId(row.try_get("customer_id")?),
            product_id: row.try_get("product_id")?,
            product_version: row.try_get("product_version")?,
            product_group: row.try_get("product_group")?,
            is_add_on: row.try_get("is_add_on")?,
            entity_id: entity_id.map(EntityId),
            status: status
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            started_at: row.try_get("started_at")?,
            trial_ends_at: row.try_get("trial_ends_at")?,
            canceled_at: row.try_get("canceled_at")?,
            ended_at: row.try_get("ended_at")?,
            processor_subscription_id: row.try_get("processor_subscription_id")?,
            processor_schedule_id: row.try_get("processor_schedule_id")?,
            options: options.0,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// One carried-over balance, created at a reset boundary.
/// Entries are kept oldest-first; `usage` records how much of the original
/// carry has since been consumed so grants stay auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverEntry {
    pub balance: i64,
    pub usage: i64,
    pub expires_at: OffsetDateTime,
}

/// A live feature grant owned by one CustomerProduct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerEntitlement {
    pub id: Uuid,
    pub customer_product_id: Uuid,
    pub customer_id: CustomerId,
    pub feature_id: String,
    /// Current-period balance (excludes rollover entries)
    pub balance: i64,
    /// Base allowance granted each period
    pub included_usage: i64,
    /// Additional prepaid units granted each period
    pub prepaid_granted: i64,
    pub unlimited: bool,
    /// Overage permitted: balance may go negative and is billed in arrears
    pub usage_allowed: bool,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub next_reset_at: Option<OffsetDateTime>,
    pub entity_id: Option<EntityId>,
    /// Oldest-first; consumed before `balance`
    pub rollovers: Vec<RolloverEntry>,
    /// Deprovisioned continuous-use units retained as free replacements
    pub replaceables: i64,
    pub replaceables_expire_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl CustomerEntitlement {
    pub fn rollover_balance(&self) -> i64 {
        self.rollovers.iter().map(|r| r.balance).sum()
    }

    pub fn rollover_usage(&self) -> i64 {
        self.rollovers.iter().map(|r| r.usage).sum()
    }

    /// Everything this instance has ever been granted for the current window
    pub fn granted(&self) -> i64 {
        self.included_usage
            + self.prepaid_granted
            + self.rollover_balance()
            + self.rollover_usage()
    }

    /// What is left to spend right now
    pub fn current(&self) -> i64 {
        self.balance + self.rollover_balance()
    }

    /// Usage consumed in the current window
    pub fn used(&self) -> i64 {
        self.granted() - self.current()
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CustomerEntitlement {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let interval: String = row.try_get("reset_interval")?;
        let rollovers: Json<Vec<RolloverEntry>> = row.try_get("rollovers")?;
        let entity_id: Option<Uuid> = row.try_get("entity_id")?;
        Ok(Self {
            id: row.try_get("id")?,
            customer_product_id: row.try_get("customer_product_id")?,
            customer_id: CustomerId(row.try_get("customer_id")?),
            feature_id: row.try_get("feature_id")?,
            balance: row.try_get("balance")?,
            included_usage: row.try_get("included_usage")?,
            prepaid_granted: row.try_get("prepaid_granted")?,
            unlimited: row.try_get("unlimited")?,
            usage_allowed: row.try_get("usage_allowed")?,
            interval: interval
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            interval_count: row.try_get("interval_count")?,
            next_reset_at: row.try_get("next_reset_at")?,
            entity_id: entity_id.map(EntityId),
            rollovers: rollovers.0,
            replaceables: row.try_get("replaceables")?,
            replaceables_expire_at: row.try_get("replaceables_expire_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Persistence for the customer ledger
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get_customer(&self, customer_id: CustomerId) -> BillingResult<Customer> {
        let customer: Option<Customer> = sqlx::query_as(
            "SELECT id, name, env, processor_customer_id, created_at FROM customers WHERE id = $1",
        )
        .bind(customer_id.0)
        .fetch_optional(&self.pool)
        .await?;

        customer.ok_or_else(|| BillingError::NotFound(format!("Customer {} not found", customer_id)))
    }

    pub async fn entity_exists(&self, customer_id: CustomerId, entity_id: EntityId) -> BillingResult<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM entities WHERE id = $1 AND customer_id = $2")
                .bind(entity_id.0)
                .bind(customer_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Every non-expired product attachment for a customer
    pub async fn customer_products(
        &self,
        customer_id: CustomerId,
    ) -> BillingResult<Vec<CustomerProduct>> {
        let products: Vec<CustomerProduct> = sqlx::query_as(
            r#"
            SELECT * FROM customer_products
            WHERE customer_id = $1 AND status != 'expired'
            ORDER BY created_at ASC
            "#,
        )
        .bind(customer_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }

    /// Every entitlement owned by a live (active/trialing/past-due) product
    pub async fn live_entitlements(
        &self,
        customer_id: CustomerId,
    ) -> BillingResult<Vec<CustomerEntitlement>> {
        let ents: Vec<CustomerEntitlement> = sqlx::query_as(
            r#"
            SELECT ce.* FROM customer_entitlements ce
            JOIN customer_products cp ON cp.id = ce.customer_product_id
            WHERE ce.customer_id = $1
              AND cp.status IN ('active', 'trialing', 'past_due')
            ORDER BY cp.created_at ASC, ce.created_at ASC
            "#,
        )
        .bind(customer_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(ents)
    }

    /// Live entitlements for one feature, oldest owning product first
    /// (the deduction tie-break order), locked for update
    pub async fn lock_feature_entitlements(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_id: CustomerId,
        feature_id: &str,
        entity_id: Option<EntityId>,
    ) -> BillingResult<Vec<CustomerEntitlement>> {
        let ents: Vec<CustomerEntitlement> = sqlx::query_as(
            r#"
            SELECT ce.* FROM customer_entitlements ce
            JOIN customer_products cp ON cp.id = ce.customer_product_id
            WHERE ce.customer_id = $1
              AND ce.feature_id = $2
              AND cp.status IN ('active', 'trialing', 'past_due')
              AND ($3::uuid IS NULL OR ce.entity_id IS NULL OR ce.entity_id = $3)
            ORDER BY cp.created_at ASC, ce.created_at ASC
            FOR UPDATE OF ce
            "#,
        )
        .bind(customer_id.0)
        .bind(feature_id)
        .bind(entity_id.map(|e| e.0))
        .fetch_all(&mut **tx)
        .await?;
        Ok(ents)
    }

    /// Serialize plan mutations for one customer.
    ///
    /// Taken before the billing context is built and held (transaction-scoped)
    /// until the executor commits, because the context read and the later
    /// ledger write are not otherwise atomic against a second mutation.
    pub async fn lock_customer(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_id: CustomerId,
    ) -> BillingResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(customer_id.0.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn insert_customer_product(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        product: &CustomerProduct,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_products (
                id, customer_id, product_id, product_version, product_group, is_add_on,
                entity_id, status, started_at, trial_ends_at, canceled_at, ended_at,
                processor_subscription_id, processor_schedule_id, options, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(product.id)
        .bind(product.customer_id.0)
        .bind(&product.product_id)
        .bind(product.product_version)
        .bind(&product.product_group)
        .bind(product.is_add_on)
        .bind(product.entity_id.map(|e| e.0))
        .bind(product.status.to_string())
        .bind(product.started_at)
        .bind(product.trial_ends_at)
        .bind(product.canceled_at)
        .bind(product.ended_at)
        .bind(&product.processor_subscription_id)
        .bind(&product.processor_schedule_id)
        .bind(Json(&product.options))
        .bind(product.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn insert_entitlement(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ent: &CustomerEntitlement,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_entitlements (
                id, customer_product_id, customer_id, feature_id, balance,
                included_usage, prepaid_granted, unlimited, usage_allowed,
                reset_interval, interval_count, next_reset_at, entity_id,
                rollovers, replaceables, replaceables_expire_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(ent.id)
        .bind(ent.customer_product_id)
        .bind(ent.customer_id.0)
        .bind(&ent.feature_id)
        .bind(ent.balance)
        .bind(ent.included_usage)
        .bind(ent.prepaid_granted)
        .bind(ent.unlimited)
        .bind(ent.usage_allowed)
        .bind(ent.interval.to_string())
        .bind(ent.interval_count)
        .bind(ent.next_reset_at)
        .bind(ent.entity_id.map(|e| e.0))
        .bind(Json(&ent.rollovers))
        .bind(ent.replaceables)
        .bind(ent.replaceables_expire_at)
        .bind(ent.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn expire_customer_product(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_product_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customer_products
            SET status = 'expired', ended_at = $2
            WHERE id = $1
            "#,
        )
        .bind(customer_product_id)
        .bind(at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_canceled(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_product_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE customer_products SET canceled_at = $2 WHERE id = $1")
            .bind(customer_product_id)
            .bind(at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn activate_scheduled(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_product_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customer_products
            SET status = 'active', started_at = $2
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(customer_product_id)
        .bind(at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Persist new balance state for one entitlement (deduction or reset)
    pub async fn update_entitlement_balance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ent_id: Uuid,
        balance: i64,
        rollovers: &[RolloverEntry],
        next_reset_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customer_entitlements
            SET balance = $2, rollovers = $3, next_reset_at = $4
            WHERE id = $1
            "#,
        )
        .bind(ent_id)
        .bind(balance)
        .bind(Json(rollovers))
        .bind(next_reset_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_replaceables(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ent_id: Uuid,
        count: i64,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customer_entitlements
            SET replaceables = $2, replaceables_expire_at = $3
            WHERE id = $1
            "#,
        )
        .bind(ent_id)
        .bind(count)
        .bind(expires_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_options(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_product_id: Uuid,
        options: &[FeatureOptions],
    ) -> BillingResult<()> {
        sqlx::query("UPDATE customer_products SET options = $2 WHERE id = $1")
            .bind(customer_product_id)
            .bind(Json(options))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_prepaid(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ent_id: Uuid,
        prepaid_granted: i64,
        balance: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE customer_entitlements
            SET prepaid_granted = $2, balance = $3
            WHERE id = $1
            "#,
        )
        .bind(ent_id)
        .bind(prepaid_granted)
        .bind(balance)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Backfill the subscription created for a just-inserted attachment
    pub async fn set_processor_subscription(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_product_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE customer_products SET processor_subscription_id = $2 WHERE id = $1",
        )
        .bind(customer_product_id)
        .bind(subscription_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn set_processor_schedule(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_product_id: Uuid,
        schedule_id: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE customer_products SET processor_schedule_id = $2 WHERE id = $1")
            .bind(customer_product_id)
            .bind(schedule_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn get_customer_product(
        &self,
        customer_product_id: Uuid,
    ) -> BillingResult<Option<CustomerProduct>> {
        let product: Option<CustomerProduct> =
            sqlx::query_as("SELECT * FROM customer_products WHERE id = $1")
                .bind(customer_product_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(product)
    }

    /// Re-fetch one entitlement under a row lock (the reset sweep re-checks
    /// the boundary after locking, in case a concurrent track already moved it)
    pub async fn lock_entitlement(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ent_id: Uuid,
    ) -> BillingResult<Option<CustomerEntitlement>> {
        let ent: Option<CustomerEntitlement> =
            sqlx::query_as("SELECT * FROM customer_entitlements WHERE id = $1 FOR UPDATE")
                .bind(ent_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(ent)
    }

    /// Entitlements whose reset boundary has passed (for the worker sweep)
    pub async fn due_for_reset(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<CustomerEntitlement>> {
        let ents: Vec<CustomerEntitlement> = sqlx::query_as(
            r#"
            SELECT ce.* FROM customer_entitlements ce
            JOIN customer_products cp ON cp.id = ce.customer_product_id
            WHERE ce.next_reset_at IS NOT NULL
              AND ce.next_reset_at <= $1
              AND cp.status IN ('active', 'trialing', 'past_due')
            ORDER BY ce.next_reset_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ents)
    }

    /// Scheduled products whose phase start has arrived (deferred downgrades)
    pub async fn due_scheduled_products(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<CustomerProduct>> {
        let products: Vec<CustomerProduct> = sqlx::query_as(
            r#"
            SELECT * FROM customer_products
            WHERE status = 'scheduled' AND started_at <= $1
            ORDER BY started_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn ent_with(balance: i64, included: i64, rollovers: Vec<RolloverEntry>) -> CustomerEntitlement {
        CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_product_id: Uuid::new_v4(),
            customer_id: CustomerId::new(),
            feature_id: "messages".into(),
            balance,
            included_usage: included,
            prepaid_granted: 0,
            unlimited: false,
            usage_allowed: false,
            interval: BillingInterval::Month,
            interval_count: 1,
            next_reset_at: None,
            entity_id: None,
            rollovers,
            replaceables: 0,
            replaceables_expire_at: None,
            created_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_granted_current_used_accounting() {
        let ent = ent_with(
            300,
            500,
            vec![RolloverEntry {
                balance: 40,
                usage: 60,
                expires_at: datetime!(2026-03-01 00:00 UTC),
            }],
        );
        // granted = 500 included + 40 remaining carry + 60 consumed carry
        assert_eq!(ent.granted(), 600);
        assert_eq!(ent.current(), 340);
        assert_eq!(ent.used(), 260);
    }

    #[test]
    fn test_status_is_live() {
        assert!(CustomerProductStatus::Active.is_live());
        assert!(CustomerProductStatus::PastDue.is_live());
        assert!(!CustomerProductStatus::Scheduled.is_live());
        assert!(!CustomerProductStatus::Expired.is_live());
    }
}
