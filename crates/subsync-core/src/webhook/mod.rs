//! Inbound payment webhook.
//!
//! A delivery goes through three steps, each of which can reject it:
//!
//! 1. [`SignatureVerifier`] checks the `Stripe-Signature` header against the
//!    raw body. Nothing in the body is read before this passes.
//! 2. [`WebhookEvent::from_slice`] decodes the envelope.
//! 3. [`Reconciler::handle_event`] applies it.
//!
//! [`WebhookProcessor`] runs the three in order and maps every failure to a
//! [`WebhookError`] whose status code tells the processor whether to retry.
//!
//! # Example
//!
//! ```rust,ignore
//! let processor = WebhookProcessor::new(verifier, reconciler);
//! match processor.process(&ctx, headers.get(SIGNATURE_HEADER), &body) {
//!     Ok(_) => StatusCode::OK.into_response(),
//!     Err(e) => e.into_response(),
//! }
//! ```

mod error;
mod payload;
mod signature;

use std::sync::Arc;

pub use error::WebhookError;
pub use payload::{
    CHECKOUT_COMPLETED, EventKind, INVOICE_PAID, PaymentCompleted, SUBSCRIPTION_CREATED,
    WebhookEvent,
};
pub use signature::{SignatureHeader, SignatureVerifier, sign_payload};

use crate::context::RequestContext;
use crate::reconciler::{EventOutcome, Reconciler};

/// Header carrying the processor's signature (lowercase, as `http` stores it).
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verifies, decodes, and applies webhook deliveries.
pub struct WebhookProcessor {
    verifier: SignatureVerifier,
    reconciler: Arc<Reconciler>,
}

impl WebhookProcessor {
    /// Creates a processor.
    #[must_use]
    pub const fn new(verifier: SignatureVerifier, reconciler: Arc<Reconciler>) -> Self {
        Self {
            verifier,
            reconciler,
        }
    }

    /// Processes one delivery.
    ///
    /// # Errors
    ///
    /// Returns a 400-class [`WebhookError`] for deliveries that can never
    /// succeed and [`WebhookError::Persistence`] for ones worth retrying.
    pub fn process(
        &self,
        ctx: &RequestContext,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<EventOutcome, WebhookError> {
        let result = self
            .verifier
            .verify(signature, body)
            .and_then(|()| WebhookEvent::from_slice(body))
            .and_then(|event| {
                tracing::debug!(
                    trace_id = %ctx.trace_id(),
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "webhook event verified"
                );
                self.reconciler
                    .handle_event(ctx, &event)
                    .map_err(WebhookError::from)
            });

        if let Err(err) = &result {
            if err.status_code().is_server_error() {
                tracing::error!(
                    trace_id = %ctx.trace_id(),
                    operation = "webhook",
                    outcome = err.kind(),
                    error = %err,
                    "webhook delivery failed"
                );
            } else {
                tracing::warn!(
                    trace_id = %ctx.trace_id(),
                    operation = "webhook",
                    outcome = err.kind(),
                    error = %err,
                    "webhook delivery rejected"
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::account::{AccountStore, SubscriptionPolicy};
    use crate::clock::ManualClock;
    use crate::credentials::Argon2Hasher;
    use crate::reconciler::ReconcileOutcome;
    use crate::store::{SqliteBackend, SubscriptionBackend};

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    fn processor() -> (WebhookProcessor, Arc<SqliteBackend>) {
        let backend = Arc::new(SqliteBackend::in_memory().unwrap());
        let clock = Arc::new(ManualClock::at_unix(NOW));
        let accounts = Arc::new(
            AccountStore::new(
                backend.clone(),
                Arc::new(Argon2Hasher::insecure_fast().unwrap()),
                clock.clone(),
                SubscriptionPolicy::default(),
            )
            .unwrap(),
        );
        let reconciler = Arc::new(Reconciler::new(accounts, backend.clone(), clock.clone()));
        let verifier =
            SignatureVerifier::new(SecretString::from(SECRET), TimeDelta::seconds(300), clock);
        (WebhookProcessor::new(verifier, reconciler), backend)
    }

    fn checkout_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": CHECKOUT_COMPLETED,
            "data": { "object": {
                "customer": "cus_1",
                "customer_details": { "email": "unknown@x.com" }
            }}
        }))
        .unwrap()
    }

    #[test]
    fn test_signed_delivery_is_applied() {
        let (processor, backend) = processor();
        let body = checkout_body();
        let header = sign_payload(SECRET, NOW, &body).unwrap();

        let outcome = processor
            .process(&RequestContext::new(), Some(&header), &body)
            .unwrap();
        assert!(matches!(
            outcome,
            EventOutcome::Reconciled(ReconcileOutcome::Pending { .. })
        ));
        assert!(backend.delivery_processed("evt_1").unwrap());
    }

    #[test]
    fn test_bad_signature_has_no_side_effects() {
        let (processor, backend) = processor();
        let body = checkout_body();
        let header = sign_payload("not-the-secret", NOW, &body).unwrap();

        let err = processor
            .process(&RequestContext::new(), Some(&header), &body)
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
        assert_eq!(backend.stats().unwrap().pending_count, 0);
        assert_eq!(backend.stats().unwrap().delivery_count, 0);
    }

    #[test]
    fn test_signed_garbage_is_invalid_payload() {
        let (processor, _backend) = processor();
        let body = br#"{"hello":"world"}"#;
        let header = sign_payload(SECRET, NOW, body).unwrap();

        let err = processor
            .process(&RequestContext::new(), Some(&header), body)
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidPayload(_)));
    }
}
