//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use payflow_reconcile::WebhookError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("webhook signature verification failed")]
    SignatureInvalid,
    #[error("webhook payload could not be parsed: {0}")]
    MalformedPayload(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::SignatureInvalid => ApiError::SignatureInvalid,
            WebhookError::MalformedPayload(message) => ApiError::MalformedPayload(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // The body never echoes signature details back to the caller.
            ApiError::SignatureInvalid => {
                (StatusCode::BAD_REQUEST, "invalid signature".to_string())
            }
            ApiError::MalformedPayload(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
