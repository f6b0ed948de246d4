//! Processor webhook endpoint

use axum::{extract::State, http::HeaderMap, http::StatusCode};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Receive a processor webhook: verify the signature against the raw body,
/// then apply the event. Returns 200 on duplicates so the processor stops
/// redelivering.
pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::WebhookSignatureInvalid)?;

    let event = state.webhooks.verify_event(&body, signature)?;
    state.webhooks.handle_event(event).await?;
    Ok(StatusCode::OK)
}
