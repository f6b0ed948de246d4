//! Billing error types

use thiserror::Error;

/// Billing-specific errors
///
/// The taxonomy matters for callers: `Validation` and `NotFound` surface
/// immediately and are never retried, `ProcessorTransient` is retried by the
/// executor with backoff and an idempotency key, `ProcessorRejected` surfaces
/// as an actionable error with the ledger untouched, and `ConsistencyAnomaly`
/// never reaches a request path at all (logged and alerted only).
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Processor transient error: {0}")]
    ProcessorTransient(String),

    #[error("Processor rejected request: {0}")]
    ProcessorRejected(String),

    #[error("Processor state could not be fetched: {0}")]
    ProcessorUnhealthy(String),

    #[error("Consistency anomaly: {0}")]
    ConsistencyAnomaly(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the executor's retry loop should try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ProcessorTransient(_) | BillingError::ProcessorUnhealthy(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(req) => {
                // Rate limits and 5xx are safe to retry with an idempotency
                // key; everything else is the processor telling us no.
                if req.http_status == 429 || req.http_status >= 500 {
                    BillingError::ProcessorTransient(err.to_string())
                } else {
                    BillingError::ProcessorRejected(err.to_string())
                }
            }
            stripe::StripeError::Timeout => {
                BillingError::ProcessorTransient("processor request timed out".to_string())
            }
            _ => BillingError::ProcessorTransient(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::ProcessorTransient("rate limited".into()).is_retryable());
        assert!(BillingError::ProcessorUnhealthy("timeout".into()).is_retryable());
        assert!(!BillingError::Validation("bad quantity".into()).is_retryable());
        assert!(!BillingError::ProcessorRejected("card declined".into()).is_retryable());
    }
}
