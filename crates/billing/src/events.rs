//! Webhook wire format
//!
//! Signature verification and tolerant payload parsing for Stripe event
//! deliveries. Parsing is deliberately decoupled from the full Stripe
//! object model: each handler reads only the fields it acts on, so new
//! provider fields or API versions never break verification.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age (and future skew) of a delivery, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header against the raw request body.
///
/// Header format: `t=<unix>,v1=<hex hmac>[,v0=...]`. The signed payload
/// is `"{t}.{body}"`, keyed with the endpoint secret (the `whsec_`
/// prefix is not part of the key). `now_unix` is injected so tolerance
/// checks are testable.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now = now_unix,
            "webhook delivery outside signature tolerance"
        );
        return Err(BillingError::SignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());

    let expected = hex::decode(v1_signature).map_err(|_| BillingError::SignatureInvalid)?;
    mac.verify_slice(&expected)
        .map_err(|_| BillingError::SignatureInvalid)
}

/// A field the provider may send as a bare id or an expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    pub fn id(&self) -> &str {
        match self {
            ExpandableId::Id(id) => id,
            ExpandableId::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionPayload {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<ExpandableId>,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePayload {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<ExpandableId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

/// Deliveries the processor acts on. Everything else parses to
/// `Ignored` and is acknowledged without side effects.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutCompleted(CheckoutSessionPayload),
    CheckoutExpired(CheckoutSessionPayload),
    InvoicePaid(InvoicePayload),
    InvoicePaymentFailed(InvoicePayload),
    SubscriptionUpserted(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    Ignored,
}

/// A verified, parsed delivery.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub kind: WebhookEvent,
}

#[derive(Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EventData,
}

#[derive(Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// Parse a raw (already verified) delivery body.
///
/// Fails only when the envelope itself or the object of a handled event
/// type is malformed; unhandled event types always succeed as `Ignored`.
pub fn parse_event(payload: &str) -> BillingResult<Event> {
    let envelope: EventEnvelope = serde_json::from_str(payload)
        .map_err(|e| BillingError::PayloadInvalid(format!("event envelope: {e}")))?;

    fn object<T: serde::de::DeserializeOwned>(
        event_type: &str,
        value: serde_json::Value,
    ) -> BillingResult<T> {
        serde_json::from_value(value)
            .map_err(|e| BillingError::PayloadInvalid(format!("{event_type} object: {e}")))
    }

    let kind = match envelope.event_type.as_str() {
        "checkout.session.completed" => {
            WebhookEvent::CheckoutCompleted(object(&envelope.event_type, envelope.data.object)?)
        }
        "checkout.session.expired" => {
            WebhookEvent::CheckoutExpired(object(&envelope.event_type, envelope.data.object)?)
        }
        "invoice.paid" | "invoice.payment_succeeded" => {
            WebhookEvent::InvoicePaid(object(&envelope.event_type, envelope.data.object)?)
        }
        "invoice.payment_failed" => {
            WebhookEvent::InvoicePaymentFailed(object(&envelope.event_type, envelope.data.object)?)
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            WebhookEvent::SubscriptionUpserted(object(&envelope.event_type, envelope.data.object)?)
        }
        "customer.subscription.deleted" => {
            WebhookEvent::SubscriptionDeleted(object(&envelope.event_type, envelope.data.object)?)
        }
        _ => WebhookEvent::Ignored,
    };

    Ok(Event {
        id: envelope.id,
        event_type: envelope.event_type,
        created: envelope.created,
        kind,
    })
}

/// Which flow a payment object belongs to, decided from correlation
/// metadata stamped onto the checkout session and its subscription.
///
/// Exactly one variant matches a given metadata map; the checks are
/// ordered so a map carrying both a token and ids resolves to the token
/// flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Business signup or business invitation checkout
    Onboarding { token: String },
    /// Customer invitation checkout
    PrivateInvitation {
        token: String,
        business_id: Option<Uuid>,
        tier_id: Option<Uuid>,
    },
    /// Public customer membership checkout (no token)
    Membership {
        business_id: Uuid,
        tier_id: Option<Uuid>,
    },
}

impl Correlation {
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Option<Self> {
        if let Some(token) = metadata.get("onboarding_token") {
            return Some(Correlation::Onboarding {
                token: token.clone(),
            });
        }

        let business_id = metadata
            .get("business_id")
            .and_then(|v| Uuid::parse_str(v).ok());
        let tier_id = metadata.get("tier_id").and_then(|v| Uuid::parse_str(v).ok());

        if let Some(token) = metadata.get("invitation_token") {
            return Some(Correlation::PrivateInvitation {
                token: token.clone(),
                business_id,
                tier_id,
            });
        }

        business_id.map(|business_id| Correlation::Membership {
            business_id,
            tier_id,
        })
    }
}
