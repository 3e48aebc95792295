//! Event envelope decoding.
//!
//! Only the fields reconciliation needs are extracted. Everything else in the
//! processor's object is ignored.

use serde::Deserialize;
use serde_json::Value;

use super::WebhookError;

/// Wire name of the payment-completed event.
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
/// Wire name of the subscription-created event.
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
/// Wire name of the invoice-paid event.
pub const INVOICE_PAID: &str = "invoice.payment_succeeded";

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// A completed checkout: who paid, and as which processor customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCompleted {
    /// Email entered at checkout; may differ from the account email.
    pub payment_email: String,
    /// Processor customer id.
    pub payment_customer_ref: String,
}

/// What an event means to this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Drives reconciliation.
    PaymentCompleted(PaymentCompleted),
    /// Logged only.
    SubscriptionCreated {
        subscription_id: Option<String>,
        customer_ref: Option<String>,
    },
    /// Logged only.
    InvoicePaid {
        invoice_id: Option<String>,
        customer_ref: Option<String>,
    },
    /// Acknowledged and ignored.
    Other,
}

/// A decoded webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    /// Processor event id, used as the delivery idempotency key.
    pub id: String,
    /// Wire event type, e.g. `checkout.session.completed`.
    pub event_type: String,
    /// Interpreted content.
    pub kind: EventKind,
}

impl WebhookEvent {
    /// Decodes a verified request body.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidPayload`] if the body is not an event
    /// envelope, or if a payment-completed event lacks the payer email or
    /// customer id.
    pub fn from_slice(body: &[u8]) -> Result<Self, WebhookError> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
        if envelope.id.is_empty() {
            return Err(WebhookError::InvalidPayload("empty event id".into()));
        }

        let object = &envelope.data.object;
        let kind = match envelope.event_type.as_str() {
            CHECKOUT_COMPLETED => {
                let payment_email = non_empty(object.pointer("/customer_details/email"))
                    .ok_or_else(|| {
                        WebhookError::InvalidPayload("checkout has no customer email".into())
                    })?;
                let payment_customer_ref = non_empty(object.get("customer")).ok_or_else(|| {
                    WebhookError::InvalidPayload("checkout has no customer".into())
                })?;
                EventKind::PaymentCompleted(PaymentCompleted {
                    payment_email,
                    payment_customer_ref,
                })
            },
            SUBSCRIPTION_CREATED => EventKind::SubscriptionCreated {
                subscription_id: non_empty(object.get("id")),
                customer_ref: non_empty(object.get("customer")),
            },
            INVOICE_PAID => EventKind::InvoicePaid {
                invoice_id: non_empty(object.get("id")),
                customer_ref: non_empty(object.get("customer")),
            },
            _ => EventKind::Other,
        };

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            kind,
        })
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
