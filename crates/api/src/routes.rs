//! HTTP routes
//!
//! Two endpoints: the payment webhook and a health probe. The webhook
//! handler verifies the signature against the raw body before any JSON
//! parsing happens, then hands the typed event to the receiver.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use payflow_reconcile::WebhookDisposition;

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payments", post(payment_webhook))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// Payment provider webhook endpoint.
///
/// Always acknowledges authentic deliveries with 200, even when the
/// triggered reconciliation fails internally; the provider's retry loop is
/// not the recovery path for engine failures, replay tooling is.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    let event = state.receiver.verify_and_decode(&body, signature)?;
    let disposition = state.receiver.handle_event(event).await;

    if let WebhookDisposition::Reconciled {
        payment_id,
        outcome,
    } = &disposition
    {
        tracing::info!(
            payment_id = %payment_id,
            success = outcome.is_success(),
            "Webhook reconciliation finished"
        );
    }

    Ok(Json(json!({
        "received": true,
        "action": disposition.action(),
    })))
}
