//! End-to-end plan lifecycle scenarios
//!
//! Chains the pure engine stages the way the executor and worker do at
//! runtime: compute a plan, apply its ledger mutations to an in-memory
//! ledger snapshot, feed the next context from the result. No database and
//! no processor account; the side-effecting layers are covered by their own
//! tests.

use tally_billing::balance::{aggregate_feature, apply_reset, plan_deduction, BalanceSource};
use tally_billing::catalog::{
    BillingInterval, Feature, FeatureKind, PriceItem, Product, ReplaceableExpiry, RolloverPolicy,
    UsageModel,
};
use tally_billing::context::{
    BillingContext, ItemState, ProcessorSnapshot, SubscriptionState, TargetProduct,
};
use tally_billing::ledger::{
    Customer, CustomerEntitlement, CustomerProduct, CustomerProductStatus, FeatureOptions,
};
use tally_billing::plan::{
    compute_cancel_plan, compute_plan, phase_item_ops, BillingBehavior, BillingPlan,
    LedgerMutation, PlanTiming, ProcessorOp, TransitionKind,
};
use tally_billing::verifier::{check_mutation_drift, AnomalyKind};
use tally_shared::{AppEnv, CustomerId};
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

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

fn metered_item(feature: &str, included: i64, rollover: Option<RolloverPolicy>) -> PriceItem {
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
        rollover,
        replaceable_expiry: ReplaceableExpiry::default(),
        processor_price_id: None,
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

fn customer(id: CustomerId) -> Customer {
    Customer {
        id,
        name: "acme".into(),
        env: AppEnv::Sandbox,
        processor_customer_id: Some("cus_test".into()),
        created_at: datetime!(2026-01-01 00:00 UTC),
    }
}

/// An in-memory stand-in for the ledger during a scenario
#[derive(Default)]
struct Ledger {
    products: Vec<CustomerProduct>,
    entitlements: Vec<CustomerEntitlement>,
}

impl Ledger {
    /// Apply a plan's ledger mutations the way the executor would
    fn apply(&mut self, plan: &BillingPlan, now: OffsetDateTime) {
        for mutation in &plan.ledger {
            match mutation {
                LedgerMutation::InsertProduct(row) => self.products.push(row.clone()),
                LedgerMutation::InsertEntitlement(ent) => self.entitlements.push(ent.clone()),
                LedgerMutation::ExpireProduct { customer_product_id } => {
                    if let Some(p) = self.products.iter_mut().find(|p| p.id == *customer_product_id)
                    {
                        p.status = CustomerProductStatus::Expired;
                        p.ended_at = Some(now);
                    }
                }
                LedgerMutation::MarkCanceled {
                    customer_product_id,
                    at,
                } => {
                    if let Some(p) = self.products.iter_mut().find(|p| p.id == *customer_product_id)
                    {
                        p.canceled_at = Some(*at);
                    }
                }
                LedgerMutation::SetOptions {
                    customer_product_id,
                    options,
                } => {
                    if let Some(p) = self.products.iter_mut().find(|p| p.id == *customer_product_id)
                    {
                        p.options = options.clone();
                    }
                }
                LedgerMutation::SetPrepaid {
                    entitlement_id,
                    prepaid_granted,
                    balance,
                } => {
                    if let Some(e) =
                        self.entitlements.iter_mut().find(|e| e.id == *entitlement_id)
                    {
                        e.prepaid_granted = *prepaid_granted;
                        e.balance = *balance;
                    }
                }
                LedgerMutation::SetReplaceables {
                    entitlement_id,
                    count,
                    expires_at,
                } => {
                    if let Some(e) =
                        self.entitlements.iter_mut().find(|e| e.id == *entitlement_id)
                    {
                        e.replaceables = *count;
                        e.replaceables_expire_at = *expires_at;
                    }
                }
            }
        }
        // Subscription ids land via the executor's backfill; simulate it for
        // rows created alongside a CreateSubscription op
        for op in &plan.processor {
            if let ProcessorOp::CreateSubscription {
                customer_product_id,
                ..
            } = op
            {
                if let Some(p) = self.products.iter_mut().find(|p| p.id == *customer_product_id) {
                    p.processor_subscription_id = Some("sub_test".into());
                }
            }
        }
    }

    fn live(&self) -> Vec<CustomerProduct> {
        self.products
            .iter()
            .filter(|p| p.status != CustomerProductStatus::Expired)
            .cloned()
            .collect()
    }

    fn live_entitlements(&self) -> Vec<CustomerEntitlement> {
        let live: Vec<Uuid> = self
            .products
            .iter()
            .filter(|p| p.status.is_live())
            .map(|p| p.id)
            .collect();
        self.entitlements
            .iter()
            .filter(|e| live.contains(&e.customer_product_id))
            .cloned()
            .collect()
    }
}

fn context(
    customer_id: CustomerId,
    ledger: &Ledger,
    attached_defs: Vec<Product>,
    subs: Vec<SubscriptionState>,
    targets: Vec<TargetProduct>,
    now: OffsetDateTime,
) -> BillingContext {
    BillingContext {
        customer: customer(customer_id),
        now,
        products: ledger.live(),
        attached_defs,
        entitlements: ledger.live_entitlements(),
        processor: ProcessorSnapshot {
            subscriptions: subs,
        },
        targets,
    }
}

fn target(def: &Product, options: Vec<FeatureOptions>) -> TargetProduct {
    TargetProduct {
        product: def.clone(),
        options,
        entity_id: None,
    }
}

/// What the processor would report for `sub_test` after a plan's ops ran
fn sub_after(plan: &BillingPlan, start: OffsetDateTime, end: OffsetDateTime) -> SubscriptionState {
    let mut items = Vec::new();
    for op in &plan.processor {
        if let ProcessorOp::CreateSubscription { items: created, .. } = op {
            for (i, item) in created.iter().enumerate() {
                items.push(ItemState {
                    item_id: format!("si_{}", i),
                    price_id: item.price_id.clone(),
                    quantity: item.quantity,
                });
            }
        }
    }
    SubscriptionState {
        subscription_id: "sub_test".into(),
        status: "active".into(),
        period_start: start,
        period_end: end,
        cancel_at_period_end: false,
        schedule_id: None,
        items,
    }
}

#[test]
fn free_to_paid_to_upgrade_to_cancel() {
    let customer_id = CustomerId::new();
    let free = product("free", 1, vec![metered_item("messages", 100, None)]);
    let basic = product(
        "basic",
        1,
        vec![flat_item(3000, "price_basic"), metered_item("messages", 1000, None)],
    );
    let pro = product(
        "pro",
        1,
        vec![flat_item(6000, "price_pro"), metered_item("messages", 5000, None)],
    );

    let mut ledger = Ledger::default();

    // Attach the free plan
    let now = datetime!(2026-06-01 00:00 UTC);
    let ctx = context(customer_id, &ledger, vec![], vec![], vec![target(&free, vec![])], now);
    let attach = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    assert_eq!(attach.transition, TransitionKind::NewAttach);
    assert_eq!(attach.due_now_cents, 0);
    assert!(attach.processor.is_empty());
    ledger.apply(&attach, now);
    assert_eq!(ledger.live_entitlements().len(), 1);

    // Replace it with basic: a subscription starts and the free grant expires
    let now = datetime!(2026-06-05 00:00 UTC);
    let ctx = context(
        customer_id,
        &ledger,
        vec![free.clone()],
        vec![],
        vec![target(&basic, vec![])],
        now,
    );
    let to_paid = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    assert_eq!(to_paid.transition, TransitionKind::FreeToPaid);
    assert_eq!(to_paid.due_now_cents, 3000);
    assert!(to_paid
        .processor
        .iter()
        .any(|op| matches!(op, ProcessorOp::CreateSubscription { .. })));
    ledger.apply(&to_paid, now);

    let free_row = ledger
        .products
        .iter()
        .find(|p| p.product_id == "free")
        .unwrap();
    assert_eq!(free_row.status, CustomerProductStatus::Expired);
    let ents = ledger.live_entitlements();
    assert_eq!(ents.len(), 1);
    assert_eq!(ents[0].balance, 1000);

    // Upgrade to pro 10 days into the 30-day period: credit 2/3 of 3000,
    // charge 2/3 of 6000
    let sub = sub_after(
        &to_paid,
        datetime!(2026-06-05 00:00 UTC),
        datetime!(2026-07-05 00:00 UTC),
    );
    let now = datetime!(2026-06-15 00:00 UTC);
    let ctx = context(
        customer_id,
        &ledger,
        vec![basic.clone()],
        vec![sub],
        vec![target(&pro, vec![])],
        now,
    );
    let upgrade = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    assert_eq!(upgrade.transition, TransitionKind::UpgradeSameInterval);
    assert_eq!(upgrade.due_now_cents, 2000);
    assert_eq!(upgrade.next_cycle_cents, 6000);
    ledger.apply(&upgrade, now);

    let ents = ledger.live_entitlements();
    assert_eq!(ents.len(), 1);
    assert_eq!(ents[0].included_usage, 5000);

    // Cancel at period end: ledger row survives with canceled_at set
    let pro_row_id = ledger
        .products
        .iter()
        .find(|p| p.product_id == "pro")
        .unwrap()
        .id;
    let sub = SubscriptionState {
        subscription_id: "sub_test".into(),
        status: "active".into(),
        period_start: datetime!(2026-06-05 00:00 UTC),
        period_end: datetime!(2026-07-05 00:00 UTC),
        cancel_at_period_end: false,
        schedule_id: None,
        items: vec![ItemState {
            item_id: "si_pro".into(),
            price_id: "price_pro".into(),
            quantity: Some(1),
        }],
    };
    let now = datetime!(2026-06-20 00:00 UTC);
    let ctx = context(customer_id, &ledger, vec![pro.clone()], vec![sub], vec![], now);
    let cancel = compute_cancel_plan(&ctx, pro_row_id, false).unwrap();
    assert!(matches!(
        cancel.processor.as_slice(),
        [ProcessorOp::CancelAtPeriodEnd { .. }]
    ));
    ledger.apply(&cancel, now);
    let pro_row = ledger.products.iter().find(|p| p.id == pro_row_id).unwrap();
    assert_eq!(pro_row.canceled_at, Some(now));
    assert!(pro_row.status.is_live());
}

#[test]
fn deferred_downgrade_activates_at_the_boundary() {
    let customer_id = CustomerId::new();
    let pro = product("pro", 1, vec![flat_item(6000, "price_pro")]);
    let basic = product("basic", 1, vec![flat_item(3000, "price_basic")]);

    let mut ledger = Ledger::default();
    let now = datetime!(2026-06-01 00:00 UTC);
    let ctx = context(customer_id, &ledger, vec![], vec![], vec![target(&pro, vec![])], now);
    let attach = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    ledger.apply(&attach, now);

    let period_end = datetime!(2026-07-01 00:00 UTC);
    let sub = sub_after(&attach, now, period_end);

    // Mid-period downgrade defers: nothing due, new row dormant
    let now = datetime!(2026-06-15 00:00 UTC);
    let ctx = context(
        customer_id,
        &ledger,
        vec![pro.clone()],
        vec![sub.clone()],
        vec![target(&basic, vec![])],
        now,
    );
    let downgrade = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    assert_eq!(downgrade.transition, TransitionKind::Downgrade);
    assert_eq!(downgrade.due_now_cents, 0);
    ledger.apply(&downgrade, now);

    let scheduled = ledger
        .products
        .iter()
        .find(|p| p.product_id == "basic")
        .unwrap();
    assert_eq!(scheduled.status, CustomerProductStatus::Scheduled);
    assert_eq!(scheduled.started_at, period_end);
    // Only the live pro grant is visible until the boundary
    assert!(ledger
        .live_entitlements()
        .iter()
        .all(|e| e.customer_product_id != scheduled.id));

    // At the boundary the item diff swaps pro for basic
    let ops = phase_item_ops(&sub, &basic, &scheduled.options);
    assert!(ops.iter().any(|op| matches!(
        op,
        ProcessorOp::AddItem { price_id, .. } if price_id == "price_basic"
    )));
    assert!(ops
        .iter()
        .any(|op| matches!(op, ProcessorOp::RemoveItem { .. })));
}

#[test]
fn usage_reset_and_rollover_across_two_periods() {
    let customer_id = CustomerId::new();
    let policy = RolloverPolicy {
        max: 500,
        length_periods: 1,
    };
    let def = product("pro", 1, vec![metered_item("messages", 1000, Some(policy))]);

    let mut ledger = Ledger::default();
    let now = datetime!(2026-06-01 00:00 UTC);
    let ctx = context(customer_id, &ledger, vec![], vec![], vec![target(&def, vec![])], now);
    let attach = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    ledger.apply(&attach, now);

    // Consume 300 of the 1000
    let ents = ledger.live_entitlements();
    let outcome = plan_deduction(&ents, 300);
    assert_eq!(outcome.unapplied, 0);
    for m in &outcome.mutations {
        let e = ledger
            .entitlements
            .iter_mut()
            .find(|e| e.id == m.entitlement_id)
            .unwrap();
        e.balance = m.balance;
        e.rollovers = m.rollovers.clone();
    }
    assert_eq!(ledger.live_entitlements()[0].balance, 700);

    // Cross the boundary: 500 of the 700 carries under the cap
    let boundary = datetime!(2026-07-01 00:00 UTC);
    let ent = ledger.live_entitlements().remove(0);
    let reset = apply_reset(&ent, Some(policy), boundary);
    assert_eq!(reset.balance, 1000);
    assert_eq!(reset.rollovers.len(), 1);
    assert_eq!(reset.rollovers[0].balance, 500);
    assert_eq!(reset.rollovers[0].expires_at, datetime!(2026-08-01 00:00 UTC));
    assert_eq!(reset.next_reset_at, Some(datetime!(2026-08-01 00:00 UTC)));
    {
        let e = ledger
            .entitlements
            .iter_mut()
            .find(|e| e.id == ent.id)
            .unwrap();
        e.balance = reset.balance;
        e.rollovers = reset.rollovers;
        e.next_reset_at = reset.next_reset_at;
    }

    // The rollover drains before the fresh grant
    let ents = ledger.live_entitlements();
    let outcome = plan_deduction(&ents, 600);
    let m = &outcome.mutations[0];
    assert_eq!(m.rollovers[0].balance, 0);
    assert_eq!(m.rollovers[0].usage, 500);
    assert_eq!(m.balance, 900);

    // The aggregated view agrees with the raw state
    {
        let e = ledger
            .entitlements
            .iter_mut()
            .find(|e| e.id == m.entitlement_id)
            .unwrap();
        e.balance = m.balance;
        e.rollovers = m.rollovers.clone();
    }
    let feature = Feature {
        id: "messages".into(),
        name: "Messages".into(),
        kind: FeatureKind::Metered,
    };
    let ents = ledger.live_entitlements();
    let sources: Vec<BalanceSource<'_>> = ents
        .iter()
        .map(|e| BalanceSource {
            ent: e,
            product_id: "pro",
        })
        .collect();
    let balance = aggregate_feature(&feature, &sources);
    assert_eq!(balance.current_balance, 900);
    assert_eq!(balance.usage, 600);
    assert_eq!(balance.granted_balance, 1500);
}

#[test]
fn migration_drift_check_catches_prespent_grant() {
    let customer_id = CustomerId::new();
    let v1 = product("pro", 1, vec![metered_item("messages", 1000, None)]);
    let v2 = product("pro", 2, vec![metered_item("messages", 2000, None)]);

    let mut ledger = Ledger::default();
    let now = datetime!(2026-06-01 00:00 UTC);
    let ctx = context(customer_id, &ledger, vec![], vec![], vec![target(&v1, vec![])], now);
    let attach = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    ledger.apply(&attach, now);

    // Use 400, then migrate to v2
    let ents = ledger.live_entitlements();
    let outcome = plan_deduction(&ents, 400);
    for m in &outcome.mutations {
        let e = ledger
            .entitlements
            .iter_mut()
            .find(|e| e.id == m.entitlement_id)
            .unwrap();
        e.balance = m.balance;
    }

    let before = ledger.live_entitlements();
    let now = datetime!(2026-06-10 00:00 UTC);
    let ctx = context(
        customer_id,
        &ledger,
        vec![v1.clone()],
        vec![],
        vec![target(&v2, vec![])],
        now,
    );
    let migration = compute_plan(&ctx, BillingBehavior::Prorate, PlanTiming::Auto).unwrap();
    assert_eq!(migration.transition, TransitionKind::Migration);
    ledger.apply(&migration, now);
    let after = ledger.live_entitlements();

    // Usage carried over one-for-one: granted rose 1000, usage rose 0
    assert_eq!(after[0].balance, 1600);
    assert!(check_mutation_drift(&before, &after).is_none());

    // A corrupted mutation that burns the whole new grant trips the check
    let mut bad = after.clone();
    bad[0].balance = after[0].balance - 1000;
    let anomaly = check_mutation_drift(&before, &bad).unwrap();
    assert_eq!(anomaly.kind, AnomalyKind::UsageDrift);
}
