//! Product / price / entitlement catalog
//!
//! Catalog rows are immutable once a customer references them: editing a
//! product that has attachments means inserting a new version row, never an
//! in-place update. That invariant is what lets the plan computer treat a
//! `Product` as a value.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// How long a catalog entry may be served from the process-wide cache.
/// Invalidation on product edits is explicit; the TTL is only a backstop.
const CATALOG_CACHE_TTL: Duration = Duration::seconds(60);

/// Feature kind: metered features carry numeric balances, boolean features
/// are pure on/off grants and bypass all balance arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Metered,
    Boolean,
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureKind::Metered => write!(f, "metered"),
            FeatureKind::Boolean => write!(f, "boolean"),
        }
    }
}

impl std::str::FromStr for FeatureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metered" => Ok(FeatureKind::Metered),
            "boolean" => Ok(FeatureKind::Boolean),
            other => Err(format!("unknown feature kind: {}", other)),
        }
    }
}

/// A feature that products can grant and usage events can deduct from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub name: String,
    pub kind: FeatureKind,
}

/// Billing interval for a price item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    OneOff,
    Month,
    Quarter,
    SemiAnnual,
    Year,
}

impl BillingInterval {
    pub fn months(&self) -> u32 {
        match self {
            BillingInterval::OneOff => 0,
            BillingInterval::Month => 1,
            BillingInterval::Quarter => 3,
            BillingInterval::SemiAnnual => 6,
            BillingInterval::Year => 12,
        }
    }

    /// Advance a timestamp by `count` intervals, clamping the day-of-month
    /// (Jan 31 + 1 month = Feb 28/29)
    pub fn advance(&self, from: OffsetDateTime, count: u32) -> OffsetDateTime {
        let months = self.months() * count;
        if months == 0 {
            return from;
        }
        add_months(from, months as i32)
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingInterval::OneOff => "one_off",
            BillingInterval::Month => "month",
            BillingInterval::Quarter => "quarter",
            BillingInterval::SemiAnnual => "semi_annual",
            BillingInterval::Year => "year",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_off" => Ok(BillingInterval::OneOff),
            "month" => Ok(BillingInterval::Month),
            "quarter" => Ok(BillingInterval::Quarter),
            "semi_annual" => Ok(BillingInterval::SemiAnnual),
            "year" => Ok(BillingInterval::Year),
            other => Err(format!("unknown billing interval: {}", other)),
        }
    }
}

fn add_months(at: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = at.date();
    let total = (date.year() * 12 + date.month() as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month_num = (total.rem_euclid(12) + 1) as u8;
    let month = match time::Month::try_from(month_num) {
        Ok(m) => m,
        Err(_) => return at,
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match time::Date::from_calendar_date(year, month, day) {
        Ok(new_date) => at.replace_date(new_date),
        Err(_) => at,
    }
}

/// Usage model for a price item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageModel {
    /// Included allowance, no per-unit charge
    Included,
    /// Customer buys N units up front each period
    Prepaid,
    /// Billed in arrears for whatever was used
    PayAsYouGo,
    /// Allocated units (seats) billed immediately on increase,
    /// prorated for continuous use
    ContinuousUse,
}

/// One graduated pricing tier. `up_to = None` means the tier is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<i64>,
    pub unit_amount_cents: i64,
}

/// Rollover policy: how much unused balance carries into the next period,
/// and for how many periods a carried entry survives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverPolicy {
    pub max: i64,
    pub length_periods: u32,
}

/// When a deprovisioned continuous-use unit stops being a free replacement.
/// Carried as policy data on the price item rather than a hardcoded window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplaceableExpiry {
    AfterGrace { seconds: i64 },
    AtNextReset,
}

impl Default for ReplaceableExpiry {
    fn default() -> Self {
        ReplaceableExpiry::AtNextReset
    }
}

/// One billable dimension of a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceItem {
    /// None = flat recurring (or one-off) price with no feature attached
    pub feature_id: Option<String>,
    pub interval: BillingInterval,
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
    pub usage_model: UsageModel,
    /// Included usage granted each period (0 for pure pay-as-you-go)
    #[serde(default)]
    pub included_usage: i64,
    /// Unlimited allowance; balance arithmetic is skipped entirely
    #[serde(default)]
    pub unlimited: bool,
    /// Prepaid purchase granularity (units per pack)
    #[serde(default = "default_billing_units")]
    pub billing_units: i64,
    /// Flat per-pack price; ignored when `tiers` is non-empty
    #[serde(default)]
    pub unit_amount_cents: Option<i64>,
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    pub rollover: Option<RolloverPolicy>,
    #[serde(default)]
    pub replaceable_expiry: ReplaceableExpiry,
    /// Opaque processor price id, set when the price is pushed to the processor
    #[serde(default)]
    pub processor_price_id: Option<String>,
}

fn default_interval_count() -> u32 {
    1
}

fn default_billing_units() -> i64 {
    1
}

impl PriceItem {
    pub fn is_flat(&self) -> bool {
        self.feature_id.is_none()
    }

    pub fn is_recurring(&self) -> bool {
        self.interval != BillingInterval::OneOff
    }

    /// Price in cents for `quantity` units.
    ///
    /// Graduated tiers when present, otherwise whole packs of
    /// `billing_units` at `unit_amount_cents` each (partial packs round up).
    pub fn amount_for_quantity(&self, quantity: i64) -> i64 {
        if quantity <= 0 {
            return 0;
        }

        if !self.tiers.is_empty() {
            let mut remaining = quantity;
            let mut last_bound = 0i64;
            let mut total = 0i64;
            for tier in &self.tiers {
                let span = match tier.up_to {
                    Some(up_to) => (up_to - last_bound).min(remaining),
                    None => remaining,
                };
                if span > 0 {
                    total += span * tier.unit_amount_cents;
                    remaining -= span;
                }
                if let Some(up_to) = tier.up_to {
                    last_bound = up_to;
                }
                if remaining == 0 {
                    break;
                }
            }
            return total;
        }

        let unit = match self.unit_amount_cents {
            Some(cents) => cents,
            None => return 0,
        };
        let units = self.billing_units.max(1);
        let packs = (quantity + units - 1) / units;
        packs * unit
    }
}

/// A versioned catalog product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub internal_id: Uuid,
    pub id: String,
    pub version: i32,
    pub group: Option<String>,
    pub is_default: bool,
    pub is_add_on: bool,
    pub free_trial_days: Option<i64>,
    pub items: Vec<PriceItem>,
    pub created_at: OffsetDateTime,
}

impl Product {
    /// A product is free when nothing on it ever produces a charge
    pub fn is_free(&self) -> bool {
        self.items.iter().all(|item| {
            item.tiers.is_empty() && item.unit_amount_cents.unwrap_or(0) == 0
        })
    }

    pub fn has_trial(&self) -> bool {
        self.free_trial_days.unwrap_or(0) > 0
    }

    /// Sum of flat recurring prices (the product's sticker price per period)
    pub fn base_amount_cents(&self) -> i64 {
        self.items
            .iter()
            .filter(|item| item.is_flat() && item.is_recurring())
            .map(|item| item.unit_amount_cents.unwrap_or(0))
            .sum()
    }

    pub fn item_for_feature(&self, feature_id: &str) -> Option<&PriceItem> {
        self.items
            .iter()
            .find(|item| item.feature_id.as_deref() == Some(feature_id))
    }

    /// The single recurring interval of this product, or None when items span
    /// multiple intervals
    pub fn recurring_interval(&self) -> Option<BillingInterval> {
        let mut intervals = self
            .items
            .iter()
            .filter(|item| item.is_recurring())
            .map(|item| item.interval);
        let first = intervals.next()?;
        if intervals.all(|i| i == first) {
            Some(first)
        } else {
            None
        }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Product {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let items: Json<Vec<PriceItem>> = row.try_get("items")?;
        Ok(Self {
            internal_id: row.try_get("internal_id")?,
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            group: row.try_get("product_group")?,
            is_default: row.try_get("is_default")?,
            is_add_on: row.try_get("is_add_on")?,
            free_trial_days: row.try_get("free_trial_days")?,
            items: items.0,
            created_at: row.try_get("created_at")?,
        })
    }
}

struct CachedProduct {
    product: Product,
    fetched_at: OffsetDateTime,
}

/// Read side of the catalog, with a process-wide TTL cache.
/// The catalog is read-only after publish; `invalidate` is called explicitly
/// on product edits.
#[derive(Clone)]
pub struct CatalogService {
    pool: PgPool,
    cache: Arc<RwLock<HashMap<String, CachedProduct>>>,
}

impl CatalogService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch the latest version of a product, via cache
    pub async fn get_product(&self, product_id: &str) -> BillingResult<Product> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(product_id) {
                if OffsetDateTime::now_utc() - entry.fetched_at < CATALOG_CACHE_TTL {
                    return Ok(entry.product.clone());
                }
            }
        }

        let product = self.fetch_latest(product_id).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            product_id.to_string(),
            CachedProduct {
                product: product.clone(),
                fetched_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(product)
    }

    /// Fetch a specific product version (always hits the database; pinned
    /// versions are only read on migration paths)
    pub async fn get_product_version(
        &self,
        product_id: &str,
        version: i32,
    ) -> BillingResult<Product> {
        let product: Option<Product> = sqlx::query_as(
            r#"
            SELECT internal_id, id, version, product_group, is_default, is_add_on,
                   free_trial_days, items, created_at
            FROM products
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(product_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        product.ok_or_else(|| {
            BillingError::NotFound(format!("Product {} v{} not found", product_id, version))
        })
    }

    async fn fetch_latest(&self, product_id: &str) -> BillingResult<Product> {
        let product: Option<Product> = sqlx::query_as(
            r#"
            SELECT internal_id, id, version, product_group, is_default, is_add_on,
                   free_trial_days, items, created_at
            FROM products
            WHERE id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        product.ok_or_else(|| BillingError::NotFound(format!("Product {} not found", product_id)))
    }

    pub async fn get_feature(&self, feature_id: &str) -> BillingResult<Feature> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id, name, kind FROM features WHERE id = $1")
                .bind(feature_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((id, name, kind)) => Ok(Feature {
                id,
                name,
                kind: kind
                    .parse()
                    .map_err(|e: String| BillingError::Internal(e))?,
            }),
            None => Err(BillingError::NotFound(format!(
                "Feature {} not found",
                feature_id
            ))),
        }
    }

    /// Drop a product from the cache after an edit published a new version
    pub async fn invalidate(&self, product_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(product_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_interval_advance_clamps_day() {
        let jan31 = datetime!(2026-01-31 00:00 UTC);
        let next = BillingInterval::Month.advance(jan31, 1);
        assert_eq!(next, datetime!(2026-02-28 00:00 UTC));
    }

    #[test]
    fn test_interval_advance_year_boundary() {
        let nov = datetime!(2026-11-15 12:00 UTC);
        assert_eq!(
            BillingInterval::Quarter.advance(nov, 1),
            datetime!(2027-02-15 12:00 UTC)
        );
        assert_eq!(
            BillingInterval::Year.advance(nov, 2),
            datetime!(2028-11-15 12:00 UTC)
        );
    }

    #[test]
    fn test_flat_pack_pricing_rounds_up() {
        let item = PriceItem {
            feature_id: Some("messages".into()),
            interval: BillingInterval::Month,
            interval_count: 1,
            usage_model: UsageModel::Prepaid,
            included_usage: 0,
            unlimited: false,
            billing_units: 100,
            unit_amount_cents: Some(500),
            tiers: vec![],
            rollover: None,
            replaceable_expiry: ReplaceableExpiry::default(),
            processor_price_id: None,
        };
        assert_eq!(item.amount_for_quantity(100), 500);
        assert_eq!(item.amount_for_quantity(101), 1000);
        assert_eq!(item.amount_for_quantity(0), 0);
    }

    #[test]
    fn test_tiered_pricing_graduated() {
        let item = PriceItem {
            feature_id: Some("messages".into()),
            interval: BillingInterval::Month,
            interval_count: 1,
            usage_model: UsageModel::PayAsYouGo,
            included_usage: 0,
            unlimited: false,
            billing_units: 1,
            unit_amount_cents: None,
            tiers: vec![
                PriceTier {
                    up_to: Some(100),
                    unit_amount_cents: 10,
                },
                PriceTier {
                    up_to: None,
                    unit_amount_cents: 5,
                },
            ],
            rollover: None,
            replaceable_expiry: ReplaceableExpiry::default(),
            processor_price_id: None,
        };
        // 100 * 10 + 50 * 5
        assert_eq!(item.amount_for_quantity(150), 1250);
        assert_eq!(item.amount_for_quantity(50), 500);
    }
}
