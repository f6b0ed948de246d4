//! Tally billing engine
//!
//! Everything between "a customer wants this set of products" and "the payment
//! processor and our ledger agree about it" lives here:
//!
//! - `catalog`: immutable, versioned product/price/entitlement definitions
//! - `ledger`: per-customer attached products, entitlement instances, rollovers
//! - `balance`: pure aggregation of overlapping grants into one balance view
//! - `context`: snapshot of ledger + processor state for one mutation
//! - `plan`: pure computation of the delta to apply (the hard part)
//! - `executor`: side-effecting application of a plan, idempotent under retry
//! - `usage`: high-frequency optimistic balance deductions
//! - `verifier`: out-of-band drift detection between usage and grants
//! - `processor` / `webhooks` / `events`: the Stripe boundary
//! - `cache`: explicit cache port keyed by customer + env

pub mod balance;
pub mod cache;
pub mod catalog;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod plan;
pub mod processor;
pub mod usage;
pub mod verifier;
pub mod webhooks;

pub use error::{BillingError, BillingResult};
