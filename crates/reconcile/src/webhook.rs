//! Webhook event receiver
//!
//! Terminates inbound payment-provider webhooks: verifies the HMAC
//! signature over the raw body, decodes the payload into a closed event
//! type, and dispatches confirmed payments to the reconciliation engine.
//! The engine never sees raw JSON; this boundary is the only place that
//! touches the wire format.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::engine::{ReconcileOutcome, ReconciliationEngine};
use crate::error::WebhookError;
use crate::store::WorkflowStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew between the signature timestamp and now.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Checkout session payload, decoded from a verified event body.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: Option<String>,
    /// Embedded completion status; re-checked before dispatch even though
    /// the event type already implies completion.
    pub payment_status: Option<String>,
    /// Client-supplied reference carrying our payment id.
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub payment_intent: Option<String>,
}

/// Direct payment confirmation payload (`payment_intent.succeeded`).
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfirmation {
    pub id: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Closed set of events this receiver understands. Everything the system
/// reacts to is a variant here; unknown types are carried as `Unhandled`
/// and acknowledged without side effects.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutCompleted {
        event_id: String,
        session: CheckoutSession,
    },
    PaymentSucceeded {
        event_id: String,
        confirmation: PaymentConfirmation,
    },
    /// Subscription lifecycle events are observe-only in this workflow.
    SubscriptionLifecycle {
        event_id: String,
        event_type: String,
    },
    Unhandled {
        event_id: String,
        event_type: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// What the receiver did with an authenticated event. Every variant maps
/// to a success acknowledgment toward the provider; redelivery is never
/// the mechanism for recovering internal failures.
#[derive(Debug)]
pub enum WebhookDisposition {
    /// The engine ran; its outcome may still be a structured failure.
    Reconciled {
        payment_id: Uuid,
        outcome: ReconcileOutcome,
    },
    /// Recognized lifecycle event, logged, no side effect.
    Observed { event_type: String },
    /// Unknown event type, acknowledged without action.
    Ignored { event_type: String },
    /// Authentic event whose embedded status is not a completed payment.
    Skipped { reason: String },
    /// Authentic event with no resolvable payment id. Not retryable by
    /// redelivering the same payload.
    Malformed { reason: String },
}

impl WebhookDisposition {
    /// Short action label for the acknowledgment body and logs.
    pub fn action(&self) -> &'static str {
        match self {
            WebhookDisposition::Reconciled { .. } => "reconciled",
            WebhookDisposition::Observed { .. } => "observed",
            WebhookDisposition::Ignored { .. } => "ignored",
            WebhookDisposition::Skipped { .. } => "skipped",
            WebhookDisposition::Malformed { .. } => "malformed",
        }
    }
}

/// Verify the provider signature header against the raw body.
///
/// Header format: `t=<unix seconds>,v1=<hex hmac>[,v0=...]`. The HMAC is
/// SHA-256 over `"{t}.{body}"` keyed with the signing secret (the
/// `whsec_` prefix, if present, is not part of the key). Comparison is
/// constant-time. This check is mandatory and is never short-circuited.
pub fn verify_signature(
    signing_secret: &str,
    payload: &[u8],
    signature_header: &str,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(WebhookError::SignatureInvalid)?;

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(WebhookError::SignatureInvalid);
    }

    let secret_key = signing_secret
        .strip_prefix("whsec_")
        .unwrap_or(signing_secret);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| WebhookError::SignatureInvalid)?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    let computed = mac.finalize().into_bytes();

    let received = hex::decode(v1_signature).map_err(|_| WebhookError::SignatureInvalid)?;
    if computed.ct_eq(received.as_slice()).into() {
        Ok(())
    } else {
        Err(WebhookError::SignatureInvalid)
    }
}

/// Decode a verified body into the closed event type.
pub fn decode_event(payload: &[u8]) -> Result<WebhookEvent, WebhookError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    let event = match raw.event_type.as_str() {
        "checkout.session.completed" => {
            let session: CheckoutSession = serde_json::from_value(raw.data.object)
                .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
            WebhookEvent::CheckoutCompleted {
                event_id: raw.id,
                session,
            }
        }
        "payment_intent.succeeded" => {
            let confirmation: PaymentConfirmation = serde_json::from_value(raw.data.object)
                .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
            WebhookEvent::PaymentSucceeded {
                event_id: raw.id,
                confirmation,
            }
        }
        t if t.starts_with("customer.subscription.") => WebhookEvent::SubscriptionLifecycle {
            event_id: raw.id,
            event_type: raw.event_type,
        },
        _ => WebhookEvent::Unhandled {
            event_id: raw.id,
            event_type: raw.event_type,
        },
    };

    Ok(event)
}

/// Event receiver: verification, decoding, and dispatch in front of the
/// engine. Both event types that confirm a payment drive the same
/// idempotent entry point, so duplicate and racing deliveries are safe.
pub struct WebhookReceiver<S: WorkflowStore> {
    signing_secret: String,
    engine: ReconciliationEngine<S>,
}

impl<S: WorkflowStore> WebhookReceiver<S> {
    pub fn new(signing_secret: impl Into<String>, engine: ReconciliationEngine<S>) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            engine,
        }
    }

    /// Verify the signature and decode the body. Any error here is the
    /// caller's cue to reject the delivery; nothing has reached the
    /// engine yet.
    pub fn verify_and_decode(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, WebhookError> {
        verify_signature(&self.signing_secret, payload, signature_header)?;
        decode_event(payload)
    }

    /// Handle an authenticated event. Infallible by design: internal
    /// reconciliation failures are carried inside the disposition and the
    /// provider still gets an acknowledgment.
    pub async fn handle_event(&self, event: WebhookEvent) -> WebhookDisposition {
        match event {
            WebhookEvent::CheckoutCompleted { event_id, session } => {
                // Defense in depth: the event type implies completion, but
                // the embedded status still has to say so.
                if session.payment_status.as_deref() != Some("paid") {
                    tracing::info!(
                        event_id = %event_id,
                        payment_status = ?session.payment_status,
                        "Checkout session not paid, skipping"
                    );
                    return WebhookDisposition::Skipped {
                        reason: "checkout session payment_status is not 'paid'".to_string(),
                    };
                }

                let provider_ref = session.payment_intent.clone();
                self.dispatch(
                    &event_id,
                    extract_payment_id(session.client_reference_id.as_deref(), &session.metadata),
                    provider_ref.as_deref(),
                )
                .await
            }
            WebhookEvent::PaymentSucceeded {
                event_id,
                confirmation,
            } => {
                if confirmation.status.as_deref() != Some("succeeded") {
                    tracing::info!(
                        event_id = %event_id,
                        status = ?confirmation.status,
                        "Payment confirmation not succeeded, skipping"
                    );
                    return WebhookDisposition::Skipped {
                        reason: "payment confirmation status is not 'succeeded'".to_string(),
                    };
                }

                let provider_ref = confirmation.id.clone();
                self.dispatch(
                    &event_id,
                    extract_payment_id(None, &confirmation.metadata),
                    provider_ref.as_deref(),
                )
                .await
            }
            WebhookEvent::SubscriptionLifecycle {
                event_id,
                event_type,
            } => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Subscription lifecycle event observed, no action"
                );
                WebhookDisposition::Observed { event_type }
            }
            WebhookEvent::Unhandled {
                event_id,
                event_type,
            } => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Unhandled webhook event type"
                );
                WebhookDisposition::Ignored { event_type }
            }
        }
    }

    async fn dispatch(
        &self,
        event_id: &str,
        payment_id: Option<Uuid>,
        provider_ref: Option<&str>,
    ) -> WebhookDisposition {
        let Some(payment_id) = payment_id else {
            tracing::error!(
                event_id = %event_id,
                "Verified event carries no resolvable payment id"
            );
            return WebhookDisposition::Malformed {
                reason: "no payment id in client_reference_id or metadata".to_string(),
            };
        };

        let outcome = self.engine.reconcile(payment_id, provider_ref).await;
        WebhookDisposition::Reconciled {
            payment_id,
            outcome,
        }
    }
}

/// Payment id extraction: client-supplied reference first, then the
/// `payment_id` metadata key.
fn extract_payment_id(
    client_reference_id: Option<&str>,
    metadata: &HashMap<String, String>,
) -> Option<Uuid> {
    client_reference_id
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .or_else(|| {
            metadata
                .get("payment_id")
                .and_then(|raw| Uuid::parse_str(raw).ok())
        })
}
