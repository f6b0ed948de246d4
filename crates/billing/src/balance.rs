//! Balance aggregation
//!
//! Combines every live grant a customer holds for a feature (base allowance,
//! prepaid purchases, rollovers from prior periods, per-entity grants) into
//! one consistent balance view, and owns the two pure state transitions the
//! rest of the engine relies on: the reset-boundary rollover machine and the
//! deduction ordering used by usage tracking.
//!
//! Everything in this module is deterministic: same inputs, same outputs.
//! The database never appears here.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{BillingInterval, Feature, FeatureKind, RolloverPolicy};
use crate::ledger::{CustomerEntitlement, RolloverEntry};

/// One entitlement instance plus the product that owns it
#[derive(Debug, Clone, Copy)]
pub struct BalanceSource<'a> {
    pub ent: &'a CustomerEntitlement,
    pub product_id: &'a str,
}

/// Per-source slice of an aggregated balance, used when grants disagree on
/// reset cadence or come from different products
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceBreakdown {
    pub product_id: String,
    pub interval: BillingInterval,
    pub next_reset_at: Option<OffsetDateTime>,
    pub granted_balance: i64,
    pub current_balance: i64,
    pub usage: i64,
}

/// The customer-facing balance for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBalance {
    pub feature_id: String,
    pub unlimited: bool,
    /// Present (and the only meaningful field) for boolean features
    pub enabled: Option<bool>,
    pub granted_balance: i64,
    pub purchased_balance: i64,
    pub current_balance: i64,
    pub usage: i64,
    /// None when sources reset on different cadences ("multiple"); clients
    /// must read the breakdown in that case
    pub interval: Option<BillingInterval>,
    pub next_reset_at: Option<OffsetDateTime>,
    pub breakdown: Vec<BalanceBreakdown>,
}

impl FeatureBalance {
    fn fixed(feature_id: &str, unlimited: bool, enabled: Option<bool>) -> Self {
        Self {
            feature_id: feature_id.to_string(),
            unlimited,
            enabled,
            granted_balance: 0,
            purchased_balance: 0,
            current_balance: 0,
            usage: 0,
            interval: None,
            next_reset_at: None,
            breakdown: Vec::new(),
        }
    }
}

/// Aggregate every relevant entitlement instance into one balance view.
///
/// `sources` must already be filtered to the feature (and entity scope) in
/// question and ordered oldest-owning-product-first; the ledger queries
/// return them that way.
pub fn aggregate_feature(feature: &Feature, sources: &[BalanceSource<'_>]) -> FeatureBalance {
    if feature.kind == FeatureKind::Boolean {
        return FeatureBalance::fixed(&feature.id, false, Some(!sources.is_empty()));
    }

    if sources.iter().any(|s| s.ent.unlimited) {
        return FeatureBalance::fixed(&feature.id, true, None);
    }

    let mut breakdown: Vec<BalanceBreakdown> = Vec::new();
    let mut prepaid_total = 0i64;

    for source in sources {
        let ent = source.ent;
        prepaid_total += ent.prepaid_granted;

        let slot = breakdown.iter_mut().find(|b| {
            b.product_id == source.product_id && b.interval == ent.interval
        });
        match slot {
            Some(entry) => {
                entry.granted_balance += ent.granted();
                entry.current_balance += ent.current();
                entry.usage += ent.used();
                entry.next_reset_at = match (entry.next_reset_at, ent.next_reset_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            None => breakdown.push(BalanceBreakdown {
                product_id: source.product_id.to_string(),
                interval: ent.interval,
                next_reset_at: ent.next_reset_at,
                granted_balance: ent.granted(),
                current_balance: ent.current(),
                usage: ent.used(),
            }),
        }
    }

    let granted_balance: i64 = breakdown.iter().map(|b| b.granted_balance).sum();
    let current_balance: i64 = breakdown.iter().map(|b| b.current_balance).sum();
    let usage: i64 = breakdown.iter().map(|b| b.usage).sum();

    // Prepaid grants plus anything consumed past what was ever granted
    let purchased_balance = prepaid_total + (usage - granted_balance).max(0);

    let shared_interval = {
        let mut intervals = breakdown.iter().map(|b| b.interval);
        match intervals.next() {
            Some(first) if intervals.all(|i| i == first) => Some(first),
            _ => None,
        }
    };

    let next_reset_at = if shared_interval.is_some() {
        breakdown.iter().filter_map(|b| b.next_reset_at).min()
    } else {
        None
    };

    // A single homogeneous source needs no breakdown
    let breakdown = if breakdown.len() > 1 { breakdown } else { Vec::new() };

    FeatureBalance {
        feature_id: feature.id.clone(),
        unlimited: false,
        enabled: None,
        granted_balance,
        purchased_balance,
        current_balance,
        usage,
        interval: shared_interval,
        next_reset_at,
        breakdown,
    }
}

// =============================================================================
// Deduction planning
// =============================================================================

/// New balance state for one entitlement after a deduction
#[derive(Debug, Clone, PartialEq)]
pub struct EntMutation {
    pub entitlement_id: Uuid,
    pub balance: i64,
    pub rollovers: Vec<RolloverEntry>,
}

/// Result of planning a deduction across overlapping entitlements
#[derive(Debug, Clone)]
pub struct DeductionOutcome {
    pub mutations: Vec<EntMutation>,
    /// Remainder no entitlement could absorb (clamped, not billed)
    pub unapplied: i64,
}

/// Plan a deduction of `amount` units across `ents`.
///
/// Ordering minimizes forfeited balance: soonest-expiring rollover entries
/// drain first (across all instances), then current-period balances in the
/// order given (oldest owning product first). Overage beyond all balances
/// lands on the last instance with `usage_allowed`, whose balance goes
/// negative; otherwise it is reported as `unapplied`.
///
/// A negative `amount` is a grant and credits the oldest instance's
/// current-period balance.
pub fn plan_deduction(ents: &[CustomerEntitlement], amount: i64) -> DeductionOutcome {
    let mut mutations: Vec<EntMutation> = ents
        .iter()
        .map(|e| EntMutation {
            entitlement_id: e.id,
            balance: e.balance,
            rollovers: e.rollovers.clone(),
        })
        .collect();

    if mutations.is_empty() {
        return DeductionOutcome {
            mutations,
            unapplied: amount.max(0),
        };
    }

    if amount <= 0 {
        mutations[0].balance -= amount;
        return DeductionOutcome {
            mutations,
            unapplied: 0,
        };
    }

    let mut remaining = amount;

    // Phase 1: rollovers, soonest expiry first across every instance
    let mut rollover_refs: Vec<(usize, usize, OffsetDateTime)> = Vec::new();
    for (ent_idx, m) in mutations.iter().enumerate() {
        for (r_idx, r) in m.rollovers.iter().enumerate() {
            if r.balance > 0 {
                rollover_refs.push((ent_idx, r_idx, r.expires_at));
            }
        }
    }
    rollover_refs.sort_by_key(|&(_, _, expires_at)| expires_at);

    for (ent_idx, r_idx, _) in rollover_refs {
        if remaining == 0 {
            break;
        }
        let entry = &mut mutations[ent_idx].rollovers[r_idx];
        let take = entry.balance.min(remaining);
        entry.balance -= take;
        entry.usage += take;
        remaining -= take;
    }

    // Phase 2: current-period balances, oldest product first
    for m in mutations.iter_mut() {
        if remaining == 0 {
            break;
        }
        let take = m.balance.max(0).min(remaining);
        m.balance -= take;
        remaining -= take;
    }

    // Phase 3: overage onto the last instance that permits it
    let mut unapplied = 0;
    if remaining > 0 {
        match ents.iter().rposition(|e| e.usage_allowed) {
            Some(idx) => mutations[idx].balance -= remaining,
            None => unapplied = remaining,
        }
    }

    DeductionOutcome {
        mutations,
        unapplied,
    }
}

// =============================================================================
// Reset boundary
// =============================================================================

/// New entitlement state after crossing a reset boundary
#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutcome {
    pub balance: i64,
    pub rollovers: Vec<RolloverEntry>,
    pub next_reset_at: Option<OffsetDateTime>,
}

/// Cross a reset boundary for one entitlement.
///
/// Expired rollover entries are dropped here and only here (never lazily
/// mid-period). Unused current-period balance carries over up to whatever
/// headroom the policy cap leaves after surviving entries, then the balance
/// returns to the full per-period grant.
pub fn apply_reset(
    ent: &CustomerEntitlement,
    policy: Option<RolloverPolicy>,
    boundary: OffsetDateTime,
) -> ResetOutcome {
    let mut rollovers: Vec<RolloverEntry> = ent
        .rollovers
        .iter()
        .filter(|r| r.expires_at > boundary)
        .copied()
        .collect();

    if let Some(policy) = policy {
        let existing: i64 = rollovers.iter().map(|r| r.balance).sum();
        let headroom = (policy.max - existing).max(0);
        let carry = ent.balance.max(0).min(headroom);
        if carry > 0 {
            let periods = policy.length_periods * ent.interval_count.max(1) as u32;
            rollovers.push(RolloverEntry {
                balance: carry,
                usage: 0,
                expires_at: ent.interval.advance(boundary, periods),
            });
        }
    }

    let next_reset_at = ent
        .next_reset_at
        .map(|at| ent.interval.advance(at, ent.interval_count.max(1) as u32));

    ResetOutcome {
        balance: ent.included_usage + ent.prepaid_granted,
        rollovers,
        next_reset_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_shared::CustomerId;
    use time::macros::datetime;

    fn ent(balance: i64, included: i64, rollovers: Vec<RolloverEntry>) -> CustomerEntitlement {
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
            next_reset_at: Some(datetime!(2026-02-01 00:00 UTC)),
            entity_id: None,
            rollovers,
            replaceables: 0,
            replaceables_expire_at: None,
            created_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    fn metered(id: &str) -> Feature {
        Feature {
            id: id.into(),
            name: id.into(),
            kind: FeatureKind::Metered,
        }
    }

    #[test]
    fn test_breakdown_sums_match_totals() {
        let a = ent(300, 500, vec![]);
        let mut b = ent(40, 100, vec![]);
        b.interval = BillingInterval::Year;
        let sources = vec![
            BalanceSource {
                ent: &a,
                product_id: "pro",
            },
            BalanceSource {
                ent: &b,
                product_id: "booster",
            },
        ];
        let balance = aggregate_feature(&metered("messages"), &sources);

        assert_eq!(balance.granted_balance, 600);
        assert_eq!(balance.current_balance, 340);
        assert_eq!(balance.usage, 260);
        // Mixed intervals: no shared cadence, breakdown carries the detail
        assert_eq!(balance.interval, None);
        assert_eq!(balance.next_reset_at, None);
        assert_eq!(balance.breakdown.len(), 2);
        let granted_sum: i64 = balance.breakdown.iter().map(|e| e.granted_balance).sum();
        let usage_sum: i64 = balance.breakdown.iter().map(|e| e.usage).sum();
        assert_eq!(granted_sum, balance.granted_balance);
        assert_eq!(usage_sum, balance.usage);
    }

    #[test]
    fn test_unlimited_bypasses_aggregation() {
        let mut a = ent(300, 500, vec![]);
        a.unlimited = true;
        let sources = vec![BalanceSource {
            ent: &a,
            product_id: "pro",
        }];
        let balance = aggregate_feature(&metered("messages"), &sources);
        assert!(balance.unlimited);
        assert_eq!(balance.granted_balance, 0);
        assert!(balance.breakdown.is_empty());
    }

    #[test]
    fn test_boolean_fixed_shape() {
        let feature = Feature {
            id: "sso".into(),
            name: "SSO".into(),
            kind: FeatureKind::Boolean,
        };
        let a = ent(0, 0, vec![]);
        let present = aggregate_feature(
            &feature,
            &[BalanceSource {
                ent: &a,
                product_id: "pro",
            }],
        );
        assert_eq!(present.enabled, Some(true));
        let absent = aggregate_feature(&feature, &[]);
        assert_eq!(absent.enabled, Some(false));
    }

    #[test]
    fn test_purchased_balance_counts_prepaid_and_overage() {
        let mut a = ent(-50, 100, vec![]);
        a.prepaid_granted = 200;
        a.usage_allowed = true;
        a.balance = -50; // 350 consumed against 300 granted
        let sources = vec![BalanceSource {
            ent: &a,
            product_id: "pro",
        }];
        let balance = aggregate_feature(&metered("messages"), &sources);
        assert_eq!(balance.granted_balance, 300);
        assert_eq!(balance.usage, 350);
        assert_eq!(balance.purchased_balance, 200 + 50);
    }

    #[test]
    fn test_deduction_drains_soonest_expiring_rollover_first() {
        let a = ent(
            100,
            100,
            vec![
                RolloverEntry {
                    balance: 30,
                    usage: 0,
                    expires_at: datetime!(2026-04-01 00:00 UTC),
                },
                RolloverEntry {
                    balance: 20,
                    usage: 0,
                    expires_at: datetime!(2026-02-01 00:00 UTC),
                },
            ],
        );
        let outcome = plan_deduction(std::slice::from_ref(&a), 25);
        assert_eq!(outcome.unapplied, 0);
        let m = &outcome.mutations[0];
        // Feb entry (soonest) fully drained, Apr entry pays the remaining 5
        assert_eq!(m.rollovers[1].balance, 0);
        assert_eq!(m.rollovers[1].usage, 20);
        assert_eq!(m.rollovers[0].balance, 25);
        assert_eq!(m.rollovers[0].usage, 5);
        assert_eq!(m.balance, 100);
    }

    #[test]
    fn test_deduction_is_monotonic_on_rollovers() {
        let a = ent(
            10,
            100,
            vec![RolloverEntry {
                balance: 15,
                usage: 0,
                expires_at: datetime!(2026-02-01 00:00 UTC),
            }],
        );
        let outcome = plan_deduction(std::slice::from_ref(&a), 20);
        let m = &outcome.mutations[0];
        for (before, after) in a.rollovers.iter().zip(m.rollovers.iter()) {
            assert!(after.balance <= before.balance);
        }
        assert_eq!(m.balance, 5);
    }

    #[test]
    fn test_deduction_oldest_product_first_then_overage() {
        let old = ent(50, 100, vec![]);
        let mut newer = ent(30, 100, vec![]);
        newer.usage_allowed = true;
        let ents = vec![old.clone(), newer.clone()];

        let outcome = plan_deduction(&ents, 100);
        assert_eq!(outcome.unapplied, 0);
        assert_eq!(outcome.mutations[0].balance, 0);
        // 50 from old, 30 from newer, 20 overage onto newer
        assert_eq!(outcome.mutations[1].balance, -20);
    }

    #[test]
    fn test_deduction_clamps_without_usage_allowed() {
        let a = ent(40, 100, vec![]);
        let outcome = plan_deduction(std::slice::from_ref(&a), 100);
        assert_eq!(outcome.mutations[0].balance, 0);
        assert_eq!(outcome.unapplied, 60);
    }

    #[test]
    fn test_negative_amount_credits_oldest_instance() {
        let a = ent(40, 100, vec![]);
        let outcome = plan_deduction(std::slice::from_ref(&a), -25);
        assert_eq!(outcome.mutations[0].balance, 65);
        assert_eq!(outcome.unapplied, 0);
    }

    #[test]
    fn test_reset_overused_period_has_no_carry() {
        // 500 included, 600 tracked at day 20: balance is -100 (overage allowed)
        let mut a = ent(-100, 500, vec![]);
        a.usage_allowed = true;
        let outcome = apply_reset(
            &a,
            Some(RolloverPolicy {
                max: 200,
                length_periods: 1,
            }),
            datetime!(2026-02-01 00:00 UTC),
        );
        assert!(outcome.rollovers.is_empty());
        assert_eq!(outcome.balance, 500);
        assert_eq!(outcome.next_reset_at, Some(datetime!(2026-03-01 00:00 UTC)));
    }

    #[test]
    fn test_reset_twice_without_usage_accumulates_under_cap() {
        let policy = Some(RolloverPolicy {
            max: 200,
            length_periods: 3,
        });
        let a = ent(100, 100, vec![]);

        let first = apply_reset(&a, policy, datetime!(2026-02-01 00:00 UTC));
        assert_eq!(first.balance, 100);
        assert_eq!(first.rollovers.len(), 1);
        assert_eq!(first.rollovers[0].balance, 100);

        let mut b = a.clone();
        b.balance = first.balance;
        b.rollovers = first.rollovers;
        b.next_reset_at = first.next_reset_at;

        let second = apply_reset(&b, policy, datetime!(2026-03-01 00:00 UTC));
        // 100 fresh + min(100, 200) carried + 100 still-valid prior carry
        assert_eq!(second.rollovers.len(), 2);
        let total: i64 = second.balance + second.rollovers.iter().map(|r| r.balance).sum::<i64>();
        assert_eq!(total, 300);
        // Cumulative carry stayed within the cap at each step
        assert!(second.rollovers.iter().map(|r| r.balance).sum::<i64>() <= 200);
    }

    #[test]
    fn test_reset_cap_limits_new_carry() {
        let policy = Some(RolloverPolicy {
            max: 150,
            length_periods: 2,
        });
        let a = ent(
            120,
            100,
            vec![RolloverEntry {
                balance: 80,
                usage: 0,
                expires_at: datetime!(2026-06-01 00:00 UTC),
            }],
        );
        let outcome = apply_reset(&a, policy, datetime!(2026-02-01 00:00 UTC));
        // Only 70 of headroom left under the 150 cap
        assert_eq!(outcome.rollovers.len(), 2);
        assert_eq!(outcome.rollovers[1].balance, 70);
    }

    #[test]
    fn test_reset_drops_expired_rollovers_at_boundary() {
        let a = ent(
            0,
            100,
            vec![
                RolloverEntry {
                    balance: 50,
                    usage: 0,
                    expires_at: datetime!(2026-01-15 00:00 UTC),
                },
                RolloverEntry {
                    balance: 25,
                    usage: 0,
                    expires_at: datetime!(2026-03-15 00:00 UTC),
                },
            ],
        );
        let outcome = apply_reset(&a, None, datetime!(2026-02-01 00:00 UTC));
        assert_eq!(outcome.rollovers.len(), 1);
        assert_eq!(outcome.rollovers[0].balance, 25);
    }
}
