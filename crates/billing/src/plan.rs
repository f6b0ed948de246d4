//! Billing plan computer
//!
//! Pure functions from a `BillingContext` to a `BillingPlan`: the ledger
//! mutations to apply and the processor operations to perform, with nothing
//! executed here. Same context in, same plan out, which is what makes the
//! transition logic testable without a database or a processor account.
//!
//! Charge amounts are computed here (integer cents, half-up rounding on
//! proration) and sent to the processor as explicit invoice lines, so the
//! processor's own proration is always disabled.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{BillingInterval, PriceItem, Product, ReplaceableExpiry, UsageModel};
use crate::context::{BillingContext, SubscriptionState, TargetProduct};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    CustomerEntitlement, CustomerProduct, CustomerProductStatus, FeatureOptions, RolloverEntry,
};

/// How charges for a change are timed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingBehavior {
    /// Charge or credit the prorated difference immediately
    #[default]
    Prorate,
    /// Defer the whole change to the next cycle boundary
    NextCycleOnly,
}

/// When the plan takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTiming {
    /// Upgrades apply now, downgrades at the period boundary
    #[default]
    Auto,
    /// Force the change now, issuing credit for unused time if needed
    Immediate,
}

/// The transition a plan implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    NewAttach,
    SameProduct,
    FreeToPaid,
    TrialToPaid,
    TrialToTrial,
    UpgradeSameInterval,
    UpgradeCrossInterval,
    Downgrade,
    Migration,
    Merge,
    Cancel,
}

/// One desired subscription item. `quantity = None` for metered prices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub price_id: String,
    pub quantity: Option<i64>,
}

/// A ledger write the executor will apply transactionally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerMutation {
    InsertProduct(CustomerProduct),
    InsertEntitlement(CustomerEntitlement),
    ExpireProduct {
        customer_product_id: Uuid,
    },
    MarkCanceled {
        customer_product_id: Uuid,
        at: OffsetDateTime,
    },
    /// Persist changed feature options on an existing attachment
    SetOptions {
        customer_product_id: Uuid,
        options: Vec<FeatureOptions>,
    },
    /// Absolute new prepaid grant and balance for a quantity change
    SetPrepaid {
        entitlement_id: Uuid,
        prepaid_granted: i64,
        balance: i64,
    },
    SetReplaceables {
        entitlement_id: Uuid,
        count: i64,
        expires_at: Option<OffsetDateTime>,
    },
}

/// A processor call the executor will perform, in order, before the ledger
/// transaction commits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessorOp {
    CreateSubscription {
        /// Row (from an `InsertProduct` in the same plan) that receives the
        /// new subscription id
        customer_product_id: Uuid,
        items: Vec<PlanItem>,
        trial_end: Option<OffsetDateTime>,
    },
    AddItem {
        subscription_id: String,
        price_id: String,
        quantity: Option<i64>,
    },
    SetItemQuantity {
        subscription_id: String,
        item_id: String,
        quantity: i64,
    },
    RemoveItem {
        subscription_id: String,
        item_id: String,
    },
    /// Immediate charge (or credit when negative) on the next invoice
    InvoiceLine {
        amount_cents: i64,
        description: String,
    },
    /// Replace the item set at a future boundary instead of now
    SchedulePhase {
        subscription_id: String,
        starts_at: OffsetDateTime,
        items: Vec<PlanItem>,
    },
    EndTrialNow {
        subscription_id: String,
    },
    CancelAtPeriodEnd {
        subscription_id: String,
    },
    CancelNow {
        subscription_id: String,
    },
}

/// The full output of one plan computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPlan {
    pub transition: TransitionKind,
    pub ledger: Vec<LedgerMutation>,
    pub processor: Vec<ProcessorOp>,
    /// Net amount charged on execution (0 for trials and deferred changes)
    pub due_now_cents: i64,
    /// Recurring amount of the resulting state, per its billing period
    pub next_cycle_cents: i64,
}

impl BillingPlan {
    fn empty(transition: TransitionKind) -> Self {
        Self {
            transition,
            ledger: Vec::new(),
            processor: Vec::new(),
            due_now_cents: 0,
            next_cycle_cents: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.ledger.is_empty() && self.processor.is_empty() && self.due_now_cents == 0
    }
}

/// Share of `amount_cents` covering the time from `at` to `period_end`,
/// rounded half-up. Widened to i128 so second-granularity products of large
/// amounts cannot overflow.
pub fn prorated_amount(
    amount_cents: i64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    at: OffsetDateTime,
) -> i64 {
    let total = (period_end - period_start).whole_seconds();
    if total <= 0 {
        return 0;
    }
    let at = at.clamp(period_start, period_end);
    let remaining = (period_end - at).whole_seconds();
    let num = amount_cents as i128 * remaining as i128;
    let den = total as i128;
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    rounded as i64
}

/// Full recurring price per period for a product with the given options:
/// flat base plus prepaid packs plus continuous-use units
fn recurring_total_cents(product: &Product, options: &[FeatureOptions]) -> i64 {
    let mut total = product.base_amount_cents();
    for item in &product.items {
        if !item.is_recurring() {
            continue;
        }
        let feature_id = match &item.feature_id {
            Some(id) => id,
            None => continue,
        };
        if matches!(item.usage_model, UsageModel::Prepaid | UsageModel::ContinuousUse) {
            let quantity = option_quantity(options, feature_id);
            total += item.amount_for_quantity(quantity);
        }
    }
    total
}

/// One-off charges (non-recurring items) for a product with the given options
fn one_off_total_cents(product: &Product, options: &[FeatureOptions]) -> i64 {
    let mut total = 0;
    for item in &product.items {
        if item.is_recurring() {
            continue;
        }
        let quantity = match &item.feature_id {
            Some(feature_id) => option_quantity(options, feature_id),
            None => 1,
        };
        total += item.amount_for_quantity(quantity);
    }
    total
}

fn option_quantity(options: &[FeatureOptions], feature_id: &str) -> i64 {
    options
        .iter()
        .find(|o| o.feature_id == feature_id)
        .map(|o| o.quantity)
        .unwrap_or(0)
}

/// Approximate months covered by one billing period, for cross-interval
/// price comparison
fn period_months(product: &Product) -> i64 {
    let interval = product
        .recurring_interval()
        .unwrap_or(BillingInterval::Month);
    let count = product
        .items
        .iter()
        .find(|i| i.is_recurring())
        .map(|i| i.interval_count as i64)
        .unwrap_or(1);
    (interval.months() as i64).max(1) * count.max(1)
}

fn validate_options(product: &Product, options: &[FeatureOptions]) -> BillingResult<()> {
    for option in options {
        if option.quantity <= 0 {
            return Err(BillingError::Validation(format!(
                "Quantity for feature {} must be positive, got {}",
                option.feature_id, option.quantity
            )));
        }
        let item = product.item_for_feature(&option.feature_id);
        match item {
            Some(item)
                if matches!(
                    item.usage_model,
                    UsageModel::Prepaid | UsageModel::ContinuousUse
                ) => {}
            Some(_) => {
                return Err(BillingError::Validation(format!(
                    "Feature {} on product {} does not take a quantity",
                    option.feature_id, product.id
                )))
            }
            None => {
                return Err(BillingError::Validation(format!(
                    "Product {} has no item for feature {}",
                    product.id, option.feature_id
                )))
            }
        }
    }
    Ok(())
}

/// Subscription items a product should occupy, given its options
pub fn desired_items(product: &Product, options: &[FeatureOptions]) -> Vec<PlanItem> {
    let mut items = Vec::new();
    for item in &product.items {
        if !item.is_recurring() {
            continue;
        }
        let price_id = match &item.processor_price_id {
            Some(id) => id.clone(),
            None => continue,
        };
        let quantity = match (&item.feature_id, item.usage_model) {
            (None, _) => Some(1),
            (Some(_), UsageModel::PayAsYouGo) => None,
            (Some(feature_id), UsageModel::Prepaid) => {
                let units = option_quantity(options, feature_id);
                if units <= 0 {
                    continue;
                }
                let pack = item.billing_units.max(1);
                Some((units + pack - 1) / pack)
            }
            (Some(feature_id), UsageModel::ContinuousUse) => {
                let units = option_quantity(options, feature_id);
                if units <= 0 {
                    continue;
                }
                Some(units)
            }
            (Some(_), UsageModel::Included) => continue,
        };
        items.push(PlanItem { price_id, quantity });
    }
    items
}

/// Item operations turning a subscription's current items into what
/// `product` with `options` should occupy. Used at phase boundaries when a
/// deferred switch comes due.
pub fn phase_item_ops(
    sub: &SubscriptionState,
    product: &Product,
    options: &[FeatureOptions],
) -> Vec<ProcessorOp> {
    diff_items(sub, &desired_items(product, options))
}

/// Item operations turning a subscription's current items into `desired`
fn diff_items(sub: &SubscriptionState, desired: &[PlanItem]) -> Vec<ProcessorOp> {
    let mut ops = Vec::new();
    for want in desired {
        match sub.items.iter().find(|i| i.price_id == want.price_id) {
            None => ops.push(ProcessorOp::AddItem {
                subscription_id: sub.subscription_id.clone(),
                price_id: want.price_id.clone(),
                quantity: want.quantity,
            }),
            Some(have) if have.quantity != want.quantity => {
                if let Some(quantity) = want.quantity {
                    ops.push(ProcessorOp::SetItemQuantity {
                        subscription_id: sub.subscription_id.clone(),
                        item_id: have.item_id.clone(),
                        quantity,
                    });
                }
            }
            Some(_) => {}
        }
    }
    for have in &sub.items {
        if !desired.iter().any(|w| w.price_id == have.price_id) {
            ops.push(ProcessorOp::RemoveItem {
                subscription_id: sub.subscription_id.clone(),
                item_id: have.item_id.clone(),
            });
        }
    }
    ops
}

/// Build the ledger rows for one new attachment
fn build_attachment(
    ctx: &BillingContext,
    target: &TargetProduct,
    status: CustomerProductStatus,
    started_at: OffsetDateTime,
    subscription_id: Option<String>,
) -> (CustomerProduct, Vec<CustomerEntitlement>) {
    let product = &target.product;
    let trial_ends_at = if status == CustomerProductStatus::Trialing {
        product
            .free_trial_days
            .map(|days| started_at + time::Duration::days(days))
    } else {
        None
    };
    let row = CustomerProduct {
        id: Uuid::new_v4(),
        customer_id: ctx.customer.id,
        product_id: product.id.clone(),
        product_version: product.version,
        product_group: product.group.clone(),
        is_add_on: product.is_add_on,
        entity_id: target.entity_id,
        status,
        started_at,
        trial_ends_at,
        canceled_at: None,
        ended_at: None,
        processor_subscription_id: subscription_id,
        processor_schedule_id: None,
        options: target.options.clone(),
        created_at: ctx.now,
    };

    let mut ents = Vec::new();
    for item in &product.items {
        let feature_id = match &item.feature_id {
            Some(id) => id.clone(),
            None => continue,
        };
        let prepaid = if matches!(
            item.usage_model,
            UsageModel::Prepaid | UsageModel::ContinuousUse
        ) {
            option_quantity(&target.options, &feature_id)
        } else {
            0
        };
        let next_reset_at = if item.is_recurring() && !item.unlimited {
            Some(item.interval.advance(started_at, item.interval_count))
        } else {
            None
        };
        ents.push(CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_product_id: row.id,
            customer_id: ctx.customer.id,
            feature_id,
            balance: item.included_usage + prepaid,
            included_usage: item.included_usage,
            prepaid_granted: prepaid,
            unlimited: item.unlimited,
            usage_allowed: matches!(
                item.usage_model,
                UsageModel::PayAsYouGo | UsageModel::ContinuousUse
            ),
            interval: item.interval,
            interval_count: item.interval_count as i32,
            next_reset_at,
            entity_id: target.entity_id,
            rollovers: Vec::new(),
            replaceables: 0,
            replaceables_expire_at: None,
            created_at: ctx.now,
        });
    }
    (row, ents)
}

fn push_attachment(
    plan: &mut BillingPlan,
    row: CustomerProduct,
    ents: Vec<CustomerEntitlement>,
) -> Uuid {
    let id = row.id;
    plan.ledger.push(LedgerMutation::InsertProduct(row));
    for ent in ents {
        plan.ledger.push(LedgerMutation::InsertEntitlement(ent));
    }
    id
}

fn classify(
    ctx: &BillingContext,
    target: &TargetProduct,
    current: Option<&CustomerProduct>,
    current_def: Option<&Product>,
) -> TransitionKind {
    let (current, current_def) = match (current, current_def) {
        (Some(c), Some(d)) => (c, d),
        _ => return TransitionKind::NewAttach,
    };

    if current.product_id == target.product.id {
        if current.product_version == target.product.version
            && current.options == target.options
        {
            return TransitionKind::SameProduct;
        }
        if current.product_version != target.product.version {
            return TransitionKind::Migration;
        }
        // Same product and version, different options
        return TransitionKind::SameProduct;
    }

    if current_def.is_free() && !target.product.is_free() {
        return TransitionKind::FreeToPaid;
    }

    if current.status == CustomerProductStatus::Trialing {
        return if target.product.has_trial() {
            TransitionKind::TrialToTrial
        } else {
            TransitionKind::TrialToPaid
        };
    }

    // Compare normalized monthly price without dividing: a1/m1 vs a2/m2
    let old_amount = recurring_total_cents(current_def, &current.options);
    let new_amount = recurring_total_cents(&target.product, &target.options);
    let old_months = period_months(current_def);
    let new_months = period_months(&target.product);
    let same_interval = current_def.recurring_interval() == target.product.recurring_interval()
        && old_months == new_months;

    if new_amount * old_months >= old_amount * new_months {
        if same_interval {
            TransitionKind::UpgradeSameInterval
        } else {
            TransitionKind::UpgradeCrossInterval
        }
    } else {
        TransitionKind::Downgrade
    }
}

/// Compute the plan for attaching `ctx.targets` to the customer.
///
/// Single-target requests cover the normal attach/upgrade/downgrade paths;
/// multiple targets are merged onto one subscription as a combined item diff.
pub fn compute_plan(
    ctx: &BillingContext,
    behavior: BillingBehavior,
    timing: PlanTiming,
) -> BillingResult<BillingPlan> {
    if ctx.targets.is_empty() {
        return Err(BillingError::Validation("No products to attach".into()));
    }
    for target in &ctx.targets {
        validate_options(&target.product, &target.options)?;
    }
    if ctx.targets.len() > 1 {
        return compute_merge_plan(ctx, behavior);
    }

    let target = &ctx.targets[0];
    let current = if target.product.is_add_on {
        None
    } else {
        ctx.current_in_group(target.product.group.as_deref(), target.entity_id)
    };
    let current_def = current.and_then(|c| ctx.attached_def(c));
    let transition = classify(ctx, target, current, current_def);

    match transition {
        TransitionKind::NewAttach => plan_new_attach(ctx, target),
        TransitionKind::SameProduct => {
            // current is always present for this transition
            let current = current.ok_or_else(|| {
                BillingError::Internal("same-product transition without a current row".into())
            })?;
            plan_option_change(ctx, target, current, behavior)
        }
        TransitionKind::FreeToPaid => {
            if behavior == BillingBehavior::NextCycleOnly {
                return Err(BillingError::Validation(
                    "A paid product cannot replace a free one at the next cycle; \
                     it must start a subscription now"
                        .into(),
                ));
            }
            let current = current.ok_or_else(|| {
                BillingError::Internal("free-to-paid transition without a current row".into())
            })?;
            plan_free_to_paid(ctx, target, current)
        }
        TransitionKind::TrialToPaid | TransitionKind::TrialToTrial => {
            let current = current.ok_or_else(|| {
                BillingError::Internal("trial transition without a current row".into())
            })?;
            if behavior == BillingBehavior::NextCycleOnly
                && transition == TransitionKind::TrialToPaid
            {
                return Err(BillingError::Validation(
                    "Replacing a trial with a paid product ends the trial now and \
                     cannot be deferred to the next cycle"
                        .into(),
                ));
            }
            plan_trial_switch(ctx, target, current, transition)
        }
        TransitionKind::UpgradeSameInterval
        | TransitionKind::UpgradeCrossInterval
        | TransitionKind::Downgrade => {
            let current = current.ok_or_else(|| {
                BillingError::Internal("plan change without a current row".into())
            })?;
            let current_def = current_def.ok_or_else(|| {
                BillingError::Internal("plan change without a catalog definition".into())
            })?;
            let defer = behavior == BillingBehavior::NextCycleOnly
                || (transition == TransitionKind::Downgrade && timing == PlanTiming::Auto);
            if defer {
                plan_deferred_switch(ctx, target, current, transition)
            } else {
                plan_immediate_switch(ctx, target, current, current_def, transition)
            }
        }
        TransitionKind::Migration => {
            let current = current.ok_or_else(|| {
                BillingError::Internal("migration without a current row".into())
            })?;
            plan_migration(ctx, target, current)
        }
        TransitionKind::Merge | TransitionKind::Cancel => Err(BillingError::Internal(
            "unexpected transition from single-target classification".into(),
        )),
    }
}

fn plan_new_attach(ctx: &BillingContext, target: &TargetProduct) -> BillingResult<BillingPlan> {
    let mut plan = BillingPlan::empty(TransitionKind::NewAttach);
    let product = &target.product;
    let trialing = product.has_trial();
    let status = if trialing {
        CustomerProductStatus::Trialing
    } else {
        CustomerProductStatus::Active
    };

    let recurring = recurring_total_cents(product, &target.options);
    let one_off = one_off_total_cents(product, &target.options);
    let items = desired_items(product, &target.options);

    let (row, ents) = build_attachment(ctx, target, status, ctx.now, None);
    let trial_end = row.trial_ends_at;
    let product_row_id = push_attachment(&mut plan, row, ents);

    if !product.is_free() && !items.is_empty() {
        plan.processor.push(ProcessorOp::CreateSubscription {
            customer_product_id: product_row_id,
            items,
            trial_end,
        });
    }
    if one_off > 0 {
        plan.processor.push(ProcessorOp::InvoiceLine {
            amount_cents: one_off,
            description: format!("{} one-time charges", product.id),
        });
    }

    plan.due_now_cents = if trialing { 0 } else { recurring + one_off };
    plan.next_cycle_cents = recurring;
    Ok(plan)
}

fn plan_free_to_paid(
    ctx: &BillingContext,
    target: &TargetProduct,
    current: &CustomerProduct,
) -> BillingResult<BillingPlan> {
    let mut inner = plan_new_attach(ctx, target)?;
    inner.transition = TransitionKind::FreeToPaid;
    inner.ledger.insert(
        0,
        LedgerMutation::ExpireProduct {
            customer_product_id: current.id,
        },
    );
    Ok(inner)
}

fn plan_trial_switch(
    ctx: &BillingContext,
    target: &TargetProduct,
    current: &CustomerProduct,
    transition: TransitionKind,
) -> BillingResult<BillingPlan> {
    let mut plan = BillingPlan::empty(transition);
    let keep_trial = transition == TransitionKind::TrialToTrial;
    let status = if keep_trial {
        CustomerProductStatus::Trialing
    } else {
        CustomerProductStatus::Active
    };

    plan.ledger.push(LedgerMutation::ExpireProduct {
        customer_product_id: current.id,
    });

    let sub = ctx.subscription_of(current);
    let sub_id = sub.map(|s| s.subscription_id.clone());
    let (mut row, ents) = build_attachment(ctx, target, status, ctx.now, sub_id.clone());
    if keep_trial {
        // Switching trials keeps the original clock; a new trial window would
        // let customers chain trials indefinitely
        row.trial_ends_at = current.trial_ends_at;
    }
    let product_row_id = row.id;
    let trial_end = row.trial_ends_at;
    push_attachment(&mut plan, row, ents);

    let recurring = recurring_total_cents(&target.product, &target.options);
    let items = desired_items(&target.product, &target.options);

    match sub {
        Some(sub) => {
            plan.processor.extend(diff_items(sub, &items));
            if !keep_trial {
                plan.processor.push(ProcessorOp::EndTrialNow {
                    subscription_id: sub.subscription_id.clone(),
                });
                // Ending the trial starts a fresh period; the processor
                // invoices the full recurring amount itself
                plan.due_now_cents = recurring;
            }
        }
        None => {
            if !target.product.is_free() && !items.is_empty() {
                plan.processor.push(ProcessorOp::CreateSubscription {
                    customer_product_id: product_row_id,
                    items,
                    trial_end: if keep_trial { trial_end } else { None },
                });
                if !keep_trial {
                    plan.due_now_cents = recurring;
                }
            }
        }
    }
    plan.next_cycle_cents = recurring;
    Ok(plan)
}

fn plan_immediate_switch(
    ctx: &BillingContext,
    target: &TargetProduct,
    current: &CustomerProduct,
    current_def: &Product,
    transition: TransitionKind,
) -> BillingResult<BillingPlan> {
    let sub = ctx.subscription_of(current).ok_or_else(|| {
        BillingError::Internal(format!(
            "Paid attachment {} has no backing subscription",
            current.id
        ))
    })?;
    let mut plan = BillingPlan::empty(transition);

    let old_amount = recurring_total_cents(current_def, &current.options);
    let new_amount = recurring_total_cents(&target.product, &target.options);
    let credit = prorated_amount(old_amount, sub.period_start, sub.period_end, ctx.now);

    plan.ledger.push(LedgerMutation::ExpireProduct {
        customer_product_id: current.id,
    });

    if transition == TransitionKind::UpgradeCrossInterval {
        // A different interval restarts the billing clock: replace the
        // subscription rather than its items
        let (row, ents) = build_attachment(
            ctx,
            target,
            CustomerProductStatus::Active,
            ctx.now,
            None,
        );
        let product_row_id = push_attachment(&mut plan, row, ents);
        plan.processor.push(ProcessorOp::CancelNow {
            subscription_id: sub.subscription_id.clone(),
        });
        plan.processor.push(ProcessorOp::CreateSubscription {
            customer_product_id: product_row_id,
            items: desired_items(&target.product, &target.options),
            trial_end: None,
        });
        if credit > 0 {
            plan.processor.push(ProcessorOp::InvoiceLine {
                amount_cents: -credit,
                description: format!("Unused time on {}", current.product_id),
            });
        }
        plan.due_now_cents = new_amount - credit;
    } else {
        let (row, ents) = build_attachment(
            ctx,
            target,
            CustomerProductStatus::Active,
            ctx.now,
            Some(sub.subscription_id.clone()),
        );
        push_attachment(&mut plan, row, ents);

        let items = desired_items(&target.product, &target.options);
        plan.processor.extend(diff_items(sub, &items));

        let charge = prorated_amount(new_amount, sub.period_start, sub.period_end, ctx.now);
        let net = charge - credit;
        // A downgrade forced immediate credits the difference; upgrades never
        // go below zero
        let net = if transition == TransitionKind::Downgrade {
            net
        } else {
            net.max(0)
        };
        if net != 0 {
            plan.processor.push(ProcessorOp::InvoiceLine {
                amount_cents: net,
                description: format!(
                    "Switch from {} to {}",
                    current.product_id, target.product.id
                ),
            });
        }
        plan.due_now_cents = net;
    }

    plan.next_cycle_cents = new_amount;
    Ok(plan)
}

/// Defer a plan change to the period boundary: the new product is written as
/// `Scheduled` and a schedule phase swaps the items when the period rolls.
/// No proration, no invoice line; the outgoing product stays live and paid-for
/// until the boundary.
fn plan_deferred_switch(
    ctx: &BillingContext,
    target: &TargetProduct,
    current: &CustomerProduct,
    transition: TransitionKind,
) -> BillingResult<BillingPlan> {
    let sub = ctx.subscription_of(current).ok_or_else(|| {
        BillingError::Internal(format!(
            "Paid attachment {} has no backing subscription",
            current.id
        ))
    })?;
    let mut plan = BillingPlan::empty(transition);

    let (row, ents) = build_attachment(
        ctx,
        target,
        CustomerProductStatus::Scheduled,
        sub.period_end,
        Some(sub.subscription_id.clone()),
    );
    push_attachment(&mut plan, row, ents);
    plan.ledger.push(LedgerMutation::MarkCanceled {
        customer_product_id: current.id,
        at: ctx.now,
    });

    plan.processor.push(ProcessorOp::SchedulePhase {
        subscription_id: sub.subscription_id.clone(),
        starts_at: sub.period_end,
        items: desired_items(&target.product, &target.options),
    });

    plan.due_now_cents = 0;
    plan.next_cycle_cents = recurring_total_cents(&target.product, &target.options);
    Ok(plan)
}

/// Quantity changes on an unchanged product: prepaid top-ups and
/// continuous-use (seat) adjustments
fn plan_option_change(
    ctx: &BillingContext,
    target: &TargetProduct,
    current: &CustomerProduct,
    behavior: BillingBehavior,
) -> BillingResult<BillingPlan> {
    let mut plan = BillingPlan::empty(TransitionKind::SameProduct);
    if current.options == target.options {
        plan.next_cycle_cents = recurring_total_cents(&target.product, &target.options);
        return Ok(plan);
    }

    let sub = ctx.subscription_of(current);
    let ents = ctx.entitlements_of(current.id);

    for item in &target.product.items {
        let feature_id = match &item.feature_id {
            Some(id) => id.clone(),
            None => continue,
        };
        if !matches!(
            item.usage_model,
            UsageModel::Prepaid | UsageModel::ContinuousUse
        ) {
            continue;
        }
        let old_qty = option_quantity(&current.options, &feature_id);
        let new_qty = option_quantity(&target.options, &feature_id);
        if old_qty == new_qty {
            continue;
        }
        let ent = ents
            .iter()
            .find(|e| e.feature_id == feature_id)
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Attachment {} has no entitlement for feature {}",
                    current.id, feature_id
                ))
            })?;

        match item.usage_model {
            UsageModel::Prepaid => plan_prepaid_change(
                &mut plan, ctx, sub, item, ent, &feature_id, old_qty, new_qty, behavior,
            ),
            UsageModel::ContinuousUse => plan_seat_change(
                &mut plan, ctx, sub, item, ent, &feature_id, old_qty, new_qty,
            ),
            _ => {}
        }
    }

    if !plan.ledger.is_empty() || !plan.processor.is_empty() {
        plan.ledger.push(LedgerMutation::SetOptions {
            customer_product_id: current.id,
            options: target.options.clone(),
        });
    }
    plan.next_cycle_cents = recurring_total_cents(&target.product, &target.options);
    Ok(plan)
}

#[allow(clippy::too_many_arguments)]
fn plan_prepaid_change(
    plan: &mut BillingPlan,
    ctx: &BillingContext,
    sub: Option<&SubscriptionState>,
    item: &PriceItem,
    ent: &CustomerEntitlement,
    feature_id: &str,
    old_qty: i64,
    new_qty: i64,
    behavior: BillingBehavior,
) {
    let pack = item.billing_units.max(1);
    let new_packs = (new_qty + pack - 1) / pack;

    if new_qty > old_qty && behavior == BillingBehavior::Prorate {
        // Top-up: grant the units now, charge the prorated difference
        let price_diff =
            item.amount_for_quantity(new_qty) - item.amount_for_quantity(old_qty);
        let charge = match sub {
            Some(sub) => prorated_amount(price_diff, sub.period_start, sub.period_end, ctx.now),
            None => price_diff,
        };
        plan.ledger.push(LedgerMutation::SetPrepaid {
            entitlement_id: ent.id,
            prepaid_granted: new_qty,
            balance: ent.balance + (new_qty - old_qty),
        });
        if charge > 0 {
            plan.processor.push(ProcessorOp::InvoiceLine {
                amount_cents: charge,
                description: format!("Additional {} units", feature_id),
            });
            plan.due_now_cents += charge;
        }
    } else {
        // Decreases (and deferred increases) take effect at the next cycle:
        // no refunds mid-period, the balance keeps what was already paid for
        plan.ledger.push(LedgerMutation::SetPrepaid {
            entitlement_id: ent.id,
            prepaid_granted: new_qty,
            balance: ent.balance,
        });
    }
    if let Some(sub) = sub {
        if let Some(have) = sub.items.iter().find(|i| {
            item.processor_price_id.as_deref() == Some(i.price_id.as_str())
        }) {
            if have.quantity != Some(new_packs) {
                plan.processor.push(ProcessorOp::SetItemQuantity {
                    subscription_id: sub.subscription_id.clone(),
                    item_id: have.item_id.clone(),
                    quantity: new_packs,
                });
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn plan_seat_change(
    plan: &mut BillingPlan,
    ctx: &BillingContext,
    sub: Option<&SubscriptionState>,
    item: &PriceItem,
    ent: &CustomerEntitlement,
    feature_id: &str,
    old_qty: i64,
    new_qty: i64,
) {
    // Replaceables that have passed their window no longer count
    let live_replaceables = match ent.replaceables_expire_at {
        Some(expiry) if expiry <= ctx.now => 0,
        _ => ent.replaceables,
    };

    if new_qty > old_qty {
        let added = new_qty - old_qty;
        // Reoccupy deprovisioned units first so a deprovision/reprovision
        // cycle inside the window is free
        let reused = added.min(live_replaceables);
        let chargeable = added - reused;
        plan.ledger.push(LedgerMutation::SetReplaceables {
            entitlement_id: ent.id,
            count: live_replaceables - reused,
            expires_at: if live_replaceables - reused > 0 {
                ent.replaceables_expire_at
            } else {
                None
            },
        });
        plan.ledger.push(LedgerMutation::SetPrepaid {
            entitlement_id: ent.id,
            prepaid_granted: new_qty,
            balance: ent.balance + added,
        });
        if chargeable > 0 {
            let price_diff = item.amount_for_quantity(old_qty + chargeable)
                - item.amount_for_quantity(old_qty);
            let charge = match sub {
                Some(sub) => {
                    prorated_amount(price_diff, sub.period_start, sub.period_end, ctx.now)
                }
                None => price_diff,
            };
            if charge > 0 {
                plan.processor.push(ProcessorOp::InvoiceLine {
                    amount_cents: charge,
                    description: format!("Additional {} seats", feature_id),
                });
                plan.due_now_cents += charge;
            }
        }
        if let Some(sub) = sub {
            if let Some(have) = sub.items.iter().find(|i| {
                item.processor_price_id.as_deref() == Some(i.price_id.as_str())
            }) {
                if have.quantity != Some(new_qty) {
                    plan.processor.push(ProcessorOp::SetItemQuantity {
                        subscription_id: sub.subscription_id.clone(),
                        item_id: have.item_id.clone(),
                        quantity: new_qty,
                    });
                }
            }
        }
    } else {
        // Deprovision: the freed units stay billed and reusable until the
        // window closes; the processor quantity is trued up at the boundary
        let removed = old_qty - new_qty;
        let expires_at = match item.replaceable_expiry {
            ReplaceableExpiry::AfterGrace { seconds } => {
                Some(ctx.now + time::Duration::seconds(seconds))
            }
            ReplaceableExpiry::AtNextReset => ent.next_reset_at,
        };
        plan.ledger.push(LedgerMutation::SetReplaceables {
            entitlement_id: ent.id,
            count: live_replaceables + removed,
            expires_at,
        });
        plan.ledger.push(LedgerMutation::SetPrepaid {
            entitlement_id: ent.id,
            prepaid_granted: new_qty,
            balance: ent.balance - removed,
        });
    }
}

/// Move an attachment to a different version of the same product, preserving
/// consumed usage
fn plan_migration(
    ctx: &BillingContext,
    target: &TargetProduct,
    current: &CustomerProduct,
) -> BillingResult<BillingPlan> {
    let mut plan = BillingPlan::empty(TransitionKind::Migration);
    let old_ents = ctx.entitlements_of(current.id);
    let sub = ctx.subscription_of(current);

    plan.ledger.push(LedgerMutation::ExpireProduct {
        customer_product_id: current.id,
    });

    let options = if target.options.is_empty() {
        current.options.clone()
    } else {
        target.options.clone()
    };
    let migrated = TargetProduct {
        product: target.product.clone(),
        options,
        entity_id: target.entity_id,
    };
    let (mut row, mut ents) = build_attachment(
        ctx,
        &migrated,
        current.status,
        current.started_at,
        current.processor_subscription_id.clone(),
    );
    row.trial_ends_at = current.trial_ends_at;

    for ent in &mut ents {
        if let Some(old) = old_ents.iter().find(|e| e.feature_id == ent.feature_id) {
            let used = old.used();
            let granted = ent.included_usage + ent.prepaid_granted;
            let balance = granted - used;
            ent.balance = if ent.usage_allowed { balance } else { balance.max(0) };
            ent.rollovers = old.rollovers.clone();
            if old.interval == ent.interval && old.interval_count == ent.interval_count {
                ent.next_reset_at = old.next_reset_at;
            }
            ent.replaceables = old.replaceables;
            ent.replaceables_expire_at = old.replaceables_expire_at;
        }
    }
    push_attachment(&mut plan, row, ents);

    if let Some(sub) = sub {
        let items = desired_items(&migrated.product, &migrated.options);
        plan.processor.extend(diff_items(sub, &items));
    }

    plan.due_now_cents = 0;
    plan.next_cycle_cents = recurring_total_cents(&migrated.product, &migrated.options);
    Ok(plan)
}

/// Attach several products in one request, sharing a single subscription.
/// The item set is recomputed as one diff so displaced products' items are
/// removed and new ones added atomically.
fn compute_merge_plan(
    ctx: &BillingContext,
    behavior: BillingBehavior,
) -> BillingResult<BillingPlan> {
    let mut intervals = ctx
        .targets
        .iter()
        .filter_map(|t| t.product.recurring_interval());
    if let Some(first) = intervals.next() {
        if intervals.any(|i| i != first) {
            return Err(BillingError::Validation(
                "Products with different billing intervals cannot share one subscription".into(),
            ));
        }
    }

    let mut plan = BillingPlan::empty(TransitionKind::Merge);
    let mut displaced: Vec<&CustomerProduct> = Vec::new();
    for target in &ctx.targets {
        if target.product.is_add_on {
            continue;
        }
        if let Some(current) =
            ctx.current_in_group(target.product.group.as_deref(), target.entity_id)
        {
            if !displaced.iter().any(|d| d.id == current.id) {
                displaced.push(current);
            }
        }
    }

    // The shared subscription, if any attachment involved already has one
    let sub = displaced
        .iter()
        .find_map(|d| ctx.subscription_of(d))
        .or_else(|| {
            ctx.products
                .iter()
                .filter(|p| p.status.is_live())
                .find_map(|p| ctx.subscription_of(p))
        });

    let mut credit = 0;
    for current in &displaced {
        plan.ledger.push(LedgerMutation::ExpireProduct {
            customer_product_id: current.id,
        });
        if let (Some(def), Some(sub)) = (ctx.attached_def(current), sub) {
            let amount = recurring_total_cents(def, &current.options);
            credit += prorated_amount(amount, sub.period_start, sub.period_end, ctx.now);
        }
    }

    // Desired = items of every retained live attachment plus the new targets
    let mut desired: Vec<PlanItem> = Vec::new();
    for product in ctx.products.iter().filter(|p| p.status.is_live()) {
        if displaced.iter().any(|d| d.id == product.id) {
            continue;
        }
        if let Some(def) = ctx.attached_def(product) {
            for item in desired_items(def, &product.options) {
                if !desired.iter().any(|d| d.price_id == item.price_id) {
                    desired.push(item);
                }
            }
        }
    }

    let mut charge = 0;
    let mut next_cycle = 0;
    let mut first_row_id = None;
    for target in &ctx.targets {
        let amount = recurring_total_cents(&target.product, &target.options);
        next_cycle += amount;
        let trialing = target.product.has_trial();
        let status = if trialing {
            CustomerProductStatus::Trialing
        } else {
            CustomerProductStatus::Active
        };
        let (row, ents) = build_attachment(
            ctx,
            target,
            status,
            ctx.now,
            sub.map(|s| s.subscription_id.clone()),
        );
        let row_id = push_attachment(&mut plan, row, ents);
        first_row_id.get_or_insert(row_id);

        if !trialing {
            charge += match (sub, behavior) {
                (Some(sub), BillingBehavior::Prorate) => {
                    prorated_amount(amount, sub.period_start, sub.period_end, ctx.now)
                }
                _ => amount,
            };
        }
        for item in desired_items(&target.product, &target.options) {
            if !desired.iter().any(|d| d.price_id == item.price_id) {
                desired.push(item);
            }
        }
    }

    match (sub, first_row_id) {
        (Some(sub), _) => {
            plan.processor.extend(diff_items(sub, &desired));
            let net = charge - credit;
            if net != 0 {
                plan.processor.push(ProcessorOp::InvoiceLine {
                    amount_cents: net,
                    description: "Subscription changes".into(),
                });
            }
            plan.due_now_cents = net;
        }
        (None, Some(row_id)) => {
            if !desired.is_empty() {
                plan.processor.push(ProcessorOp::CreateSubscription {
                    customer_product_id: row_id,
                    items: desired,
                    trial_end: None,
                });
            }
            plan.due_now_cents = charge;
        }
        (None, None) => {}
    }

    plan.next_cycle_cents = next_cycle;
    Ok(plan)
}

/// Compute the plan for detaching one product.
///
/// Default is end-of-period: the attachment is marked canceled now and
/// expires when the paid-for time runs out. `immediate` ends it now.
pub fn compute_cancel_plan(
    ctx: &BillingContext,
    customer_product_id: Uuid,
    immediate: bool,
) -> BillingResult<BillingPlan> {
    let current = ctx
        .products
        .iter()
        .find(|p| p.id == customer_product_id && p.status.is_live())
        .ok_or_else(|| {
            BillingError::NotFound(format!(
                "No live attachment {} for customer {}",
                customer_product_id, ctx.customer.id
            ))
        })?;
    let mut plan = BillingPlan::empty(TransitionKind::Cancel);

    let sub = ctx.subscription_of(current);
    let shares_subscription = sub.is_some_and(|sub| {
        ctx.products.iter().any(|p| {
            p.id != current.id
                && p.status.is_live()
                && p.processor_subscription_id.as_deref() == Some(sub.subscription_id.as_str())
        })
    });

    if immediate {
        plan.ledger.push(LedgerMutation::ExpireProduct {
            customer_product_id: current.id,
        });
    } else {
        plan.ledger.push(LedgerMutation::MarkCanceled {
            customer_product_id: current.id,
            at: ctx.now,
        });
    }

    if let Some(sub) = sub {
        if shares_subscription {
            // Other products ride the same subscription: drop only this
            // product's items
            if let Some(def) = ctx.attached_def(current) {
                let own: Vec<PlanItem> = desired_items(def, &current.options);
                for have in &sub.items {
                    if own.iter().any(|o| o.price_id == have.price_id) {
                        plan.processor.push(ProcessorOp::RemoveItem {
                            subscription_id: sub.subscription_id.clone(),
                            item_id: have.item_id.clone(),
                        });
                    }
                }
            }
        } else if immediate {
            plan.processor.push(ProcessorOp::CancelNow {
                subscription_id: sub.subscription_id.clone(),
            });
        } else if !sub.cancel_at_period_end {
            plan.processor.push(ProcessorOp::CancelAtPeriodEnd {
                subscription_id: sub.subscription_id.clone(),
            });
        }
    }

    plan.due_now_cents = 0;
    plan.next_cycle_cents = 0;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ItemState, ProcessorSnapshot};
    use crate::ledger::Customer;
    use tally_shared::{AppEnv, CustomerId};
    use time::macros::datetime;

    fn flat_item(cents: i64, price_id: &str) -> PriceItem {
        PriceItem {
            feature_id: None,
            interval: BillingInterval::Month,
            interval_count: 1,
            usage_model: UsageModel::Included,
            included_usage: 0,
            unlimited: false,
            billing_units: 1,
            unit_amount_cents: Some(cents),
            tiers: vec![],
            rollover: None,
            replaceable_expiry: ReplaceableExpiry::default(),
            processor_price_id: Some(price_id.into()),
        }
    }

    fn metered_item(feature: &str, included: i64) -> PriceItem {
        PriceItem {
            feature_id: Some(feature.into()),
            interval: BillingInterval::Month,
            interval_count: 1,
            usage_model: UsageModel::Included,
            included_usage: included,
            unlimited: false,
            billing_units: 1,
            unit_amount_cents: None,
            tiers: vec![],
            rollover: None,
            replaceable_expiry: ReplaceableExpiry::default(),
            processor_price_id: None,
        }
    }

    fn seat_item(feature: &str, cents_per_seat: i64, price_id: &str) -> PriceItem {
        PriceItem {
            feature_id: Some(feature.into()),
            interval: BillingInterval::Month,
            interval_count: 1,
            usage_model: UsageModel::ContinuousUse,
            included_usage: 0,
            unlimited: false,
            billing_units: 1,
            unit_amount_cents: Some(cents_per_seat),
            tiers: vec![],
            rollover: None,
            replaceable_expiry: ReplaceableExpiry::AfterGrace { seconds: 3600 },
            processor_price_id: Some(price_id.into()),
        }
    }

    fn product(id: &str, version: i32, items: Vec<PriceItem>) -> Product {
        Product {
            internal_id: Uuid::new_v4(),
            id: id.into(),
            version,
            group: Some("main".into()),
            is_default: false,
            is_add_on: false,
            free_trial_days: None,
            items,
            created_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    fn attachment(
        customer_id: CustomerId,
        def: &Product,
        status: CustomerProductStatus,
        sub_id: Option<&str>,
        options: Vec<FeatureOptions>,
    ) -> CustomerProduct {
        CustomerProduct {
            id: Uuid::new_v4(),
            customer_id,
            product_id: def.id.clone(),
            product_version: def.version,
            product_group: def.group.clone(),
            is_add_on: def.is_add_on,
            entity_id: None,
            status,
            started_at: datetime!(2026-06-01 00:00 UTC),
            trial_ends_at: None,
            canceled_at: None,
            ended_at: None,
            processor_subscription_id: sub_id.map(String::from),
            processor_schedule_id: None,
            options,
            created_at: datetime!(2026-06-01 00:00 UTC),
        }
    }

    fn subscription(id: &str, items: Vec<ItemState>) -> SubscriptionState {
        SubscriptionState {
            subscription_id: id.into(),
            status: "active".into(),
            period_start: datetime!(2026-06-01 00:00 UTC),
            period_end: datetime!(2026-07-01 00:00 UTC),
            cancel_at_period_end: false,
            schedule_id: None,
            items,
        }
    }

    fn context(
        products: Vec<CustomerProduct>,
        attached_defs: Vec<Product>,
        entitlements: Vec<CustomerEntitlement>,
        subs: Vec<SubscriptionState>,
        targets: Vec<TargetProduct>,
        now: OffsetDateTime,
    ) -> BillingContext {
        let customer_id = products
            .first()
            .map(|p| p.customer_id)
            .unwrap_or_else(CustomerId::new);
        BillingContext {
            customer: Customer {
                id: customer_id,
                name: "acme".into(),
                env: AppEnv::Sandbox,
                processor_customer_id: Some("cus_1".into()),
                created_at: datetime!(2026-01-01 00:00 UTC),
            },
            now,
            products,
            attached_defs,
            entitlements,
            processor: ProcessorSnapshot {
                subscriptions: subs,
            },
            targets,
        }
    }

    fn target(def: Product, options: Vec<FeatureOptions>) -> TargetProduct {
        TargetProduct {
            product: def,
            options,
            entity_id: None,
        }
    }

    #[test]
    fn test_proration_is_exact_at_one_third() {
        // A $30 period, one third elapsed: two thirds remain
        let start = datetime!(2026-06-01 00:00 UTC);
        let end = datetime!(2026-07-01 00:00 UTC);
        let at = start + (end - start) / 3;
        assert_eq!(prorated_amount(3000, start, end, at), 2000);
    }

    #[test]
    fn test_proration_clamps_outside_period() {
        let start = datetime!(2026-06-01 00:00 UTC);
        let end = datetime!(2026-07-01 00:00 UTC);
        assert_eq!(prorated_amount(3000, start, end, end + time::Duration::days(5)), 0);
        assert_eq!(prorated_amount(3000, start, end, start - time::Duration::days(5)), 3000);
    }

    #[test]
    fn test_new_attach_paid_creates_subscription() {
        let def = product("pro", 1, vec![flat_item(2000, "price_pro")]);
        let ctx = context(
            vec![],
            vec![],
            vec![],
            vec![],
            vec![target(def, vec![])],
            datetime!(2026-06-10 00:00 UTC),
        );
        let plan = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect("plan");
        assert_eq!(plan.transition, TransitionKind::NewAttach);
        assert_eq!(plan.due_now_cents, 2000);
        assert!(matches!(
            plan.processor.as_slice(),
            [ProcessorOp::CreateSubscription { .. }]
        ));
        assert!(plan
            .ledger
            .iter()
            .any(|m| matches!(m, LedgerMutation::InsertProduct(_))));
    }

    #[test]
    fn test_new_attach_with_trial_charges_nothing() {
        let mut def = product("pro", 1, vec![flat_item(2000, "price_pro")]);
        def.free_trial_days = Some(14);
        let ctx = context(
            vec![],
            vec![],
            vec![],
            vec![],
            vec![target(def, vec![])],
            datetime!(2026-06-10 00:00 UTC),
        );
        let plan = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect("plan");
        assert_eq!(plan.due_now_cents, 0);
        match &plan.processor[0] {
            ProcessorOp::CreateSubscription { trial_end, .. } => {
                assert_eq!(*trial_end, Some(datetime!(2026-06-24 00:00 UTC)));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_upgrade_prorates_difference_one_third_through() {
        let customer_id = CustomerId::new();
        let old_def = product("basic", 1, vec![flat_item(3000, "price_basic")]);
        let new_def = product("pro", 1, vec![flat_item(6000, "price_pro")]);
        let current = attachment(
            customer_id,
            &old_def,
            CustomerProductStatus::Active,
            Some("sub_1"),
            vec![],
        );
        let sub = subscription(
            "sub_1",
            vec![ItemState {
                item_id: "si_1".into(),
                price_id: "price_basic".into(),
                quantity: Some(1),
            }],
        );
        // 10 of 30 days elapsed
        let now = datetime!(2026-06-11 00:00 UTC);
        let ctx = context(
            vec![current],
            vec![old_def],
            vec![],
            vec![sub],
            vec![target(new_def, vec![])],
            now,
        );
        let plan = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect("plan");
        assert_eq!(plan.transition, TransitionKind::UpgradeSameInterval);
        // credit 2/3 of 3000 = 2000, charge 2/3 of 6000 = 4000
        assert_eq!(plan.due_now_cents, 2000);
        assert!(plan.processor.iter().any(|op| matches!(
            op,
            ProcessorOp::InvoiceLine { amount_cents: 2000, .. }
        )));
        assert!(plan.processor.iter().any(|op| matches!(
            op,
            ProcessorOp::AddItem { price_id, .. } if price_id == "price_pro"
        )));
        assert!(plan.processor.iter().any(|op| matches!(
            op,
            ProcessorOp::RemoveItem { item_id, .. } if item_id == "si_1"
        )));
    }

    #[test]
    fn test_downgrade_defers_with_no_proration() {
        let customer_id = CustomerId::new();
        let old_def = product("pro", 1, vec![flat_item(6000, "price_pro")]);
        let new_def = product("basic", 1, vec![flat_item(3000, "price_basic")]);
        let current = attachment(
            customer_id,
            &old_def,
            CustomerProductStatus::Active,
            Some("sub_1"),
            vec![],
        );
        let sub = subscription(
            "sub_1",
            vec![ItemState {
                item_id: "si_1".into(),
                price_id: "price_pro".into(),
                quantity: Some(1),
            }],
        );
        let ctx = context(
            vec![current],
            vec![old_def],
            vec![],
            vec![sub],
            vec![target(new_def, vec![])],
            datetime!(2026-06-11 00:00 UTC),
        );
        let plan = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect("plan");
        assert_eq!(plan.transition, TransitionKind::Downgrade);
        assert_eq!(plan.due_now_cents, 0);
        assert!(!plan
            .processor
            .iter()
            .any(|op| matches!(op, ProcessorOp::InvoiceLine { .. })));
        match plan
            .processor
            .iter()
            .find(|op| matches!(op, ProcessorOp::SchedulePhase { .. }))
        {
            Some(ProcessorOp::SchedulePhase { starts_at, items, .. }) => {
                assert_eq!(*starts_at, datetime!(2026-07-01 00:00 UTC));
                assert_eq!(items[0].price_id, "price_basic");
            }
            _ => panic!("expected a schedule phase"),
        }
        // New row is written now but dormant until the boundary
        let scheduled = plan.ledger.iter().find_map(|m| match m {
            LedgerMutation::InsertProduct(row) => Some(row),
            _ => None,
        });
        let scheduled = scheduled.expect("scheduled row");
        assert_eq!(scheduled.status, CustomerProductStatus::Scheduled);
        assert_eq!(scheduled.started_at, datetime!(2026-07-01 00:00 UTC));
    }

    #[test]
    fn test_free_to_paid_rejects_next_cycle_only() {
        let customer_id = CustomerId::new();
        let free_def = product("free", 1, vec![metered_item("messages", 100)]);
        let paid_def = product("pro", 1, vec![flat_item(2000, "price_pro")]);
        let current = attachment(
            customer_id,
            &free_def,
            CustomerProductStatus::Active,
            None,
            vec![],
        );
        let ctx = context(
            vec![current],
            vec![free_def],
            vec![],
            vec![],
            vec![target(paid_def, vec![])],
            datetime!(2026-06-11 00:00 UTC),
        );
        let err = compute_plan(&ctx, BillingBehavior::NextCycleOnly, PlanTiming::Auto)
            .expect_err("must reject");
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_same_product_same_options_is_noop() {
        let customer_id = CustomerId::new();
        let def = product("pro", 1, vec![flat_item(2000, "price_pro")]);
        let current = attachment(
            customer_id,
            &def,
            CustomerProductStatus::Active,
            Some("sub_1"),
            vec![],
        );
        let ctx = context(
            vec![current],
            vec![def.clone()],
            vec![],
            vec![subscription(
                "sub_1",
                vec![ItemState {
                    item_id: "si_1".into(),
                    price_id: "price_pro".into(),
                    quantity: Some(1),
                }],
            )],
            vec![target(def, vec![])],
            datetime!(2026-06-11 00:00 UTC),
        );
        let plan = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect("plan");
        assert_eq!(plan.transition, TransitionKind::SameProduct);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_zero_quantity_option_is_rejected() {
        let def = product("pro", 1, vec![seat_item("seats", 1000, "price_seat")]);
        let ctx = context(
            vec![],
            vec![],
            vec![],
            vec![],
            vec![target(
                def,
                vec![FeatureOptions {
                    feature_id: "seats".into(),
                    quantity: 0,
                }],
            )],
            datetime!(2026-06-11 00:00 UTC),
        );
        let err = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect_err("must reject");
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_seat_reprovision_within_window_is_free() {
        let customer_id = CustomerId::new();
        let def = product("pro", 1, vec![seat_item("seats", 1000, "price_seat")]);
        let current = attachment(
            customer_id,
            &def,
            CustomerProductStatus::Active,
            Some("sub_1"),
            vec![FeatureOptions {
                feature_id: "seats".into(),
                quantity: 4,
            }],
        );
        let ent = CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_product_id: current.id,
            customer_id,
            feature_id: "seats".into(),
            balance: 4,
            included_usage: 0,
            prepaid_granted: 4,
            unlimited: false,
            usage_allowed: true,
            interval: BillingInterval::Month,
            interval_count: 1,
            next_reset_at: Some(datetime!(2026-07-01 00:00 UTC)),
            entity_id: None,
            rollovers: vec![],
            // One seat was deprovisioned minutes ago
            replaceables: 1,
            replaceables_expire_at: Some(datetime!(2026-06-11 01:00 UTC)),
            created_at: datetime!(2026-06-01 00:00 UTC),
        };
        let sub = subscription(
            "sub_1",
            vec![ItemState {
                item_id: "si_1".into(),
                price_id: "price_seat".into(),
                quantity: Some(5),
            }],
        );
        let ctx = context(
            vec![current],
            vec![def.clone()],
            vec![ent],
            vec![sub],
            vec![target(
                def,
                vec![FeatureOptions {
                    feature_id: "seats".into(),
                    quantity: 5,
                }],
            )],
            datetime!(2026-06-11 00:30 UTC),
        );
        let plan = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect("plan");
        // The re-added seat consumes the replaceable credit: nothing due
        assert_eq!(plan.due_now_cents, 0);
        assert!(!plan
            .processor
            .iter()
            .any(|op| matches!(op, ProcessorOp::InvoiceLine { .. })));
        assert!(plan.ledger.iter().any(|m| matches!(
            m,
            LedgerMutation::SetReplaceables { count: 0, .. }
        )));
    }

    #[test]
    fn test_migration_preserves_consumed_usage() {
        let customer_id = CustomerId::new();
        let v1 = product("pro", 1, vec![metered_item("messages", 100)]);
        let v2 = product("pro", 2, vec![metered_item("messages", 200)]);
        let current = attachment(
            customer_id,
            &v1,
            CustomerProductStatus::Active,
            None,
            vec![],
        );
        let ent = CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_product_id: current.id,
            customer_id,
            feature_id: "messages".into(),
            // 60 of 100 used
            balance: 40,
            included_usage: 100,
            prepaid_granted: 0,
            unlimited: false,
            usage_allowed: false,
            interval: BillingInterval::Month,
            interval_count: 1,
            next_reset_at: Some(datetime!(2026-07-01 00:00 UTC)),
            entity_id: None,
            rollovers: vec![],
            replaceables: 0,
            replaceables_expire_at: None,
            created_at: datetime!(2026-06-01 00:00 UTC),
        };
        let ctx = context(
            vec![current],
            vec![v1],
            vec![ent],
            vec![],
            vec![target(v2, vec![])],
            datetime!(2026-06-15 00:00 UTC),
        );
        let plan = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect("plan");
        assert_eq!(plan.transition, TransitionKind::Migration);
        let new_ent = plan.ledger.iter().find_map(|m| match m {
            LedgerMutation::InsertEntitlement(e) => Some(e),
            _ => None,
        });
        let new_ent = new_ent.expect("migrated entitlement");
        // 200 granted minus the 60 already used
        assert_eq!(new_ent.balance, 140);
        assert_eq!(new_ent.next_reset_at, Some(datetime!(2026-07-01 00:00 UTC)));
    }

    #[test]
    fn test_merge_rejects_mixed_intervals() {
        let monthly = product("pro", 1, vec![flat_item(2000, "price_pro")]);
        let mut yearly_item = flat_item(20000, "price_addon");
        yearly_item.interval = BillingInterval::Year;
        let mut yearly = product("addon", 1, vec![yearly_item]);
        yearly.group = Some("addons".into());
        let ctx = context(
            vec![],
            vec![],
            vec![],
            vec![],
            vec![target(monthly, vec![]), target(yearly, vec![])],
            datetime!(2026-06-11 00:00 UTC),
        );
        let err = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto)
            .expect_err("must reject");
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_cancel_default_is_end_of_period() {
        let customer_id = CustomerId::new();
        let def = product("pro", 1, vec![flat_item(2000, "price_pro")]);
        let current = attachment(
            customer_id,
            &def,
            CustomerProductStatus::Active,
            Some("sub_1"),
            vec![],
        );
        let current_id = current.id;
        let ctx = context(
            vec![current],
            vec![def],
            vec![],
            vec![subscription("sub_1", vec![])],
            vec![],
            datetime!(2026-06-11 00:00 UTC),
        );
        let plan = compute_cancel_plan(&ctx, current_id, false).expect("plan");
        assert!(matches!(
            plan.ledger.as_slice(),
            [LedgerMutation::MarkCanceled { .. }]
        ));
        assert!(matches!(
            plan.processor.as_slice(),
            [ProcessorOp::CancelAtPeriodEnd { .. }]
        ));
        assert_eq!(plan.due_now_cents, 0);
    }

    #[test]
    fn test_cancel_on_shared_subscription_removes_items_only() {
        let customer_id = CustomerId::new();
        let def_a = product("pro", 1, vec![flat_item(2000, "price_pro")]);
        let mut def_b = product("addon", 1, vec![flat_item(500, "price_addon")]);
        def_b.group = Some("addons".into());
        let a = attachment(
            customer_id,
            &def_a,
            CustomerProductStatus::Active,
            Some("sub_1"),
            vec![],
        );
        let b = attachment(
            customer_id,
            &def_b,
            CustomerProductStatus::Active,
            Some("sub_1"),
            vec![],
        );
        let b_id = b.id;
        let sub = subscription(
            "sub_1",
            vec![
                ItemState {
                    item_id: "si_pro".into(),
                    price_id: "price_pro".into(),
                    quantity: Some(1),
                },
                ItemState {
                    item_id: "si_addon".into(),
                    price_id: "price_addon".into(),
                    quantity: Some(1),
                },
            ],
        );
        let ctx = context(
            vec![a, b],
            vec![def_a, def_b],
            vec![],
            vec![sub],
            vec![],
            datetime!(2026-06-11 00:00 UTC),
        );
        let plan = compute_cancel_plan(&ctx, b_id, false).expect("plan");
        assert!(matches!(
            plan.processor.as_slice(),
            [ProcessorOp::RemoveItem { item_id, .. }] if item_id == "si_addon"
        ));
        assert!(!plan
            .processor
            .iter()
            .any(|op| matches!(op, ProcessorOp::CancelAtPeriodEnd { .. })));
    }
}
