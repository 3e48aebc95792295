//! Payment event reconciliation.
//!
//! A payment-completed event either activates the account whose email
//! matches the payer's exactly, or parks the payment as a pending
//! subscription for a signed-in user to claim later. Parking is terminal for
//! the event; the lookup is never retried.
//!
//! # Redelivery
//!
//! The processor delivers at least once and retries on any non-2xx answer,
//! so every path here must be safe to run twice:
//!
//! - [`Reconciler::handle_event`] skips event ids already in the delivery
//!   ledger, and records the id only after the side effects committed. A
//!   failed attempt leaves no ledger entry, so the retry runs in full.
//! - [`Reconciler::reconcile_payment`] does not park a second row while an
//!   unclaimed one exists for the same payer email and customer.
//! - Re-activating an account restarts its period from now, which is what
//!   the first attempt would have written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::account::AccountStore;
use crate::clock::Clock;
use crate::context::RequestContext;
use crate::store::{
    AccountId, NewPending, PendingId, StoreError, SubscriptionBackend, SubscriptionStatus,
};
use crate::webhook::{EventKind, PaymentCompleted, WebhookEvent};

/// Errors that make a delivery fail and be retried.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Storage failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The matched account could not be updated.
    #[error("subscription update failed for account {account_id}")]
    AccountUpdateFailed {
        /// The account found by email.
        account_id: AccountId,
    },
}

/// Result of reconciling one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// An account matched and is now active.
    Activated {
        account_id: AccountId,
        expires_at: DateTime<Utc>,
    },
    /// No account matched; the payment was parked.
    Pending { pending_id: PendingId },
    /// No account matched and the payment was already parked.
    AlreadyPending { pending_id: PendingId },
}

/// Result of handling one webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A payment was reconciled.
    Reconciled(ReconcileOutcome),
    /// A known informational event was logged.
    Logged,
    /// An event kind this service does not act on.
    Ignored,
    /// The event id was already processed.
    Duplicate,
}

/// Applies payment events to accounts and pending subscriptions.
pub struct Reconciler {
    accounts: Arc<AccountStore>,
    backend: Arc<dyn SubscriptionBackend>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    /// Creates a reconciler over the same backend the account store uses.
    #[must_use]
    pub fn new(
        accounts: Arc<AccountStore>,
        backend: Arc<dyn SubscriptionBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            backend,
            clock,
        }
    }

    /// Reconciles one completed payment.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Storage`] if any read or write fails
    /// - [`ReconcileError::AccountUpdateFailed`] if the matched account
    ///   disappeared before it could be updated
    pub fn reconcile_payment(
        &self,
        ctx: &RequestContext,
        payment: &PaymentCompleted,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.reconcile_inner(ctx, payment);
        match &result {
            Ok(outcome) => tracing::info!(
                trace_id = %ctx.trace_id(),
                operation = "reconcile_payment",
                outcome = ?outcome,
                customer = %payment.payment_customer_ref,
                "payment reconciled"
            ),
            Err(err) => tracing::error!(
                trace_id = %ctx.trace_id(),
                operation = "reconcile_payment",
                outcome = "failed",
                customer = %payment.payment_customer_ref,
                error = %err,
                "payment reconciliation failed"
            ),
        }
        result
    }

    fn reconcile_inner(
        &self,
        ctx: &RequestContext,
        payment: &PaymentCompleted,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if let Some(account) = self.backend.account_by_email(&payment.payment_email)? {
            let update = self.accounts.subscription_update(
                Some(&payment.payment_customer_ref),
                SubscriptionStatus::Active,
                None,
            );
            if !self.accounts.apply_subscription(ctx, account.id, &update)? {
                return Err(ReconcileError::AccountUpdateFailed {
                    account_id: account.id,
                });
            }
            return Ok(ReconcileOutcome::Activated {
                account_id: account.id,
                expires_at: update.expires_at,
            });
        }

        if let Some(existing) = self.backend.oldest_unclaimed(
            &payment.payment_email,
            Some(&payment.payment_customer_ref),
        )? {
            return Ok(ReconcileOutcome::AlreadyPending {
                pending_id: existing.id,
            });
        }

        let pending = self.backend.insert_pending(&NewPending {
            payment_email: payment.payment_email.clone(),
            payment_customer_ref: payment.payment_customer_ref.clone(),
            paid_at: self.clock.now(),
        })?;
        Ok(ReconcileOutcome::Pending {
            pending_id: pending.id,
        })
    }

    /// Handles a verified, decoded webhook event.
    ///
    /// # Errors
    ///
    /// Returns an error if reconciliation or the delivery ledger fails; the
    /// event id is then left unrecorded.
    pub fn handle_event(
        &self,
        ctx: &RequestContext,
        event: &WebhookEvent,
    ) -> Result<EventOutcome, ReconcileError> {
        if self.backend.delivery_processed(&event.id)? {
            tracing::info!(
                trace_id = %ctx.trace_id(),
                operation = "handle_event",
                outcome = "duplicate",
                event_id = %event.id,
                event_type = %event.event_type,
                "delivery already processed"
            );
            return Ok(EventOutcome::Duplicate);
        }

        let outcome = match &event.kind {
            EventKind::PaymentCompleted(payment) => {
                EventOutcome::Reconciled(self.reconcile_payment(ctx, payment)?)
            },
            EventKind::SubscriptionCreated {
                subscription_id,
                customer_ref,
            } => {
                tracing::info!(
                    trace_id = %ctx.trace_id(),
                    event_id = %event.id,
                    subscription_id = subscription_id.as_deref().unwrap_or("-"),
                    customer = customer_ref.as_deref().unwrap_or("-"),
                    "subscription created"
                );
                EventOutcome::Logged
            },
            EventKind::InvoicePaid {
                invoice_id,
                customer_ref,
            } => {
                tracing::info!(
                    trace_id = %ctx.trace_id(),
                    event_id = %event.id,
                    invoice_id = invoice_id.as_deref().unwrap_or("-"),
                    customer = customer_ref.as_deref().unwrap_or("-"),
                    "invoice paid"
                );
                EventOutcome::Logged
            },
            EventKind::Other => {
                tracing::debug!(
                    trace_id = %ctx.trace_id(),
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "ignoring event type"
                );
                EventOutcome::Ignored
            },
        };

        self.backend
            .record_delivery(&event.id, &event.event_type, self.clock.now())?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeDelta;
    use secrecy::SecretString;

    use super::*;
    use crate::account::SubscriptionPolicy;
    use crate::clock::ManualClock;
    use crate::credentials::Argon2Hasher;
    use crate::store::{
        Account, ClaimAttempt, NewAccount, PendingClaim, PendingSubscription, SqliteBackend,
        StoreStats, SubscriptionUpdate,
    };

    const START: i64 = 1_700_000_000;

    /// Backend that can be told to fail writes or to lose accounts between
    /// lookup and update.
    struct FlakyBackend {
        inner: SqliteBackend,
        fail_writes: AtomicBool,
        fail_ledger: AtomicBool,
        lose_updates: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: SqliteBackend::in_memory().unwrap(),
                fail_writes: AtomicBool::new(false),
                fail_ledger: AtomicBool::new(false),
                lose_updates: AtomicBool::new(false),
            }
        }

        fn write_guard(&self, flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        }
    }

    impl SubscriptionBackend for FlakyBackend {
        fn insert_account(&self, account: &NewAccount) -> Result<Account, StoreError> {
            self.inner.insert_account(account)
        }

        fn account_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
            self.inner.account_by_id(id)
        }

        fn account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
            self.inner.account_by_email(email)
        }

        fn account_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
            self.inner.account_by_username(username)
        }

        fn update_subscription(
            &self,
            id: AccountId,
            update: &SubscriptionUpdate,
        ) -> Result<bool, StoreError> {
            self.write_guard(&self.fail_writes)?;
            if self.lose_updates.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.update_subscription(id, update)
        }

        fn insert_pending(&self, pending: &NewPending) -> Result<PendingSubscription, StoreError> {
            self.write_guard(&self.fail_writes)?;
            self.inner.insert_pending(pending)
        }

        fn pending_by_id(&self, id: PendingId) -> Result<Option<PendingSubscription>, StoreError> {
            self.inner.pending_by_id(id)
        }

        fn oldest_unclaimed(
            &self,
            email: &str,
            customer_ref: Option<&str>,
        ) -> Result<Option<PendingSubscription>, StoreError> {
            self.inner.oldest_unclaimed(email, customer_ref)
        }

        fn pending_for_email(&self, email: &str) -> Result<Vec<PendingSubscription>, StoreError> {
            self.inner.pending_for_email(email)
        }

        fn claim_pending(&self, claim: &PendingClaim<'_>) -> Result<ClaimAttempt, StoreError> {
            self.write_guard(&self.fail_writes)?;
            self.inner.claim_pending(claim)
        }

        fn delivery_processed(&self, event_id: &str) -> Result<bool, StoreError> {
            self.inner.delivery_processed(event_id)
        }

        fn record_delivery(
            &self,
            event_id: &str,
            event_kind: &str,
            processed_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.write_guard(&self.fail_ledger)?;
            self.inner.record_delivery(event_id, event_kind, processed_at)
        }

        fn stats(&self) -> Result<StoreStats, StoreError> {
            self.inner.stats()
        }
    }

    struct Fixture {
        backend: Arc<FlakyBackend>,
        accounts: Arc<AccountStore>,
        reconciler: Reconciler,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FlakyBackend::new());
        let clock = Arc::new(ManualClock::at_unix(START));
        let accounts = Arc::new(
            AccountStore::new(
                backend.clone(),
                Arc::new(Argon2Hasher::insecure_fast().unwrap()),
                clock.clone(),
                SubscriptionPolicy::default(),
            )
            .unwrap(),
        );
        let reconciler = Reconciler::new(accounts.clone(), backend.clone(), clock.clone());
        Fixture {
            backend,
            accounts,
            reconciler,
            clock,
        }
    }

    fn register(f: &Fixture, email: &str, username: &str) -> Account {
        f.accounts
            .create_account(
                &RequestContext::new(),
                email,
                username,
                &SecretString::from("correct horse"),
                "Test User",
            )
            .unwrap()
    }

    fn payment(email: &str, customer: &str) -> PaymentCompleted {
        PaymentCompleted {
            payment_email: email.to_string(),
            payment_customer_ref: customer.to_string(),
        }
    }

    fn event(id: &str, kind: EventKind) -> WebhookEvent {
        let event_type = match &kind {
            EventKind::PaymentCompleted(_) => "checkout.session.completed",
            EventKind::SubscriptionCreated { .. } => "customer.subscription.created",
            EventKind::InvoicePaid { .. } => "invoice.payment_succeeded",
            EventKind::Other => "charge.refunded",
        };
        WebhookEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            kind,
        }
    }

    #[test]
    fn test_matching_account_is_activated() {
        let f = fixture();
        let account = register(&f, "a@x.com", "ayesha");

        let outcome = f
            .reconciler
            .reconcile_payment(&RequestContext::new(), &payment("a@x.com", "cus_1"))
            .unwrap();

        let expected_expiry = DateTime::from_timestamp(START, 0).unwrap() + TimeDelta::days(30);
        assert_eq!(
            outcome,
            ReconcileOutcome::Activated {
                account_id: account.id,
                expires_at: expected_expiry,
            }
        );
        let stored = f.accounts.get(account.id).unwrap().unwrap();
        assert_eq!(stored.payment_customer_ref.as_deref(), Some("cus_1"));
        assert!(f.accounts.is_subscription_active(account.id).unwrap());
        assert_eq!(f.backend.stats().unwrap().pending_count, 0);
    }

    #[test]
    fn test_unknown_email_parks_payment_without_touching_accounts() {
        let f = fixture();
        let account = register(&f, "a@x.com", "ayesha");

        let outcome = f
            .reconciler
            .reconcile_payment(&RequestContext::new(), &payment("unknown@x.com", "cus_2"))
            .unwrap();

        let ReconcileOutcome::Pending { pending_id } = outcome else {
            panic!("expected pending, got {outcome:?}");
        };
        let row = f.backend.pending_by_id(pending_id).unwrap().unwrap();
        assert_eq!(row.payment_email, "unknown@x.com");
        assert_eq!(row.payment_customer_ref, "cus_2");
        assert_eq!(row.paid_at.timestamp(), START);
        assert!(!row.is_claimed());
        assert_eq!(f.accounts.get(account.id).unwrap().unwrap(), account);
    }

    #[test]
    fn test_email_match_is_case_sensitive() {
        let f = fixture();
        register(&f, "a@x.com", "ayesha");

        let outcome = f
            .reconciler
            .reconcile_payment(&RequestContext::new(), &payment("A@x.com", "cus_1"))
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Pending { .. }));
    }

    #[test]
    fn test_repeated_payment_does_not_duplicate_pending() {
        let f = fixture();
        let ctx = RequestContext::new();

        let first = f
            .reconciler
            .reconcile_payment(&ctx, &payment("unknown@x.com", "cus_2"))
            .unwrap();
        f.clock.advance(TimeDelta::minutes(5));
        let second = f
            .reconciler
            .reconcile_payment(&ctx, &payment("unknown@x.com", "cus_2"))
            .unwrap();

        let ReconcileOutcome::Pending { pending_id } = first else {
            panic!("expected pending, got {first:?}");
        };
        assert_eq!(second, ReconcileOutcome::AlreadyPending { pending_id });
        assert_eq!(f.backend.pending_for_email("unknown@x.com").unwrap().len(), 1);

        let other_customer = f
            .reconciler
            .reconcile_payment(&ctx, &payment("unknown@x.com", "cus_3"))
            .unwrap();
        assert!(matches!(other_customer, ReconcileOutcome::Pending { .. }));
    }

    #[test]
    fn test_storage_failure_is_reported() {
        let f = fixture();
        f.backend.fail_writes.store(true, Ordering::SeqCst);

        let result = f
            .reconciler
            .reconcile_payment(&RequestContext::new(), &payment("unknown@x.com", "cus_2"));
        assert!(matches!(result, Err(ReconcileError::Storage(_))));
        assert_eq!(f.backend.stats().unwrap().pending_count, 0);
    }

    #[test]
    fn test_lost_account_update_is_reported() {
        let f = fixture();
        let account = register(&f, "a@x.com", "ayesha");
        f.backend.lose_updates.store(true, Ordering::SeqCst);

        let result = f
            .reconciler
            .reconcile_payment(&RequestContext::new(), &payment("a@x.com", "cus_1"));
        assert!(matches!(
            result,
            Err(ReconcileError::AccountUpdateFailed { account_id }) if account_id == account.id
        ));
    }

    #[test]
    fn test_redelivered_event_has_no_side_effects() {
        let f = fixture();
        let ctx = RequestContext::new();
        let evt = event(
            "evt_1",
            EventKind::PaymentCompleted(payment("unknown@x.com", "cus_2")),
        );

        let first = f.reconciler.handle_event(&ctx, &evt).unwrap();
        assert!(matches!(
            first,
            EventOutcome::Reconciled(ReconcileOutcome::Pending { .. })
        ));
        assert_eq!(f.reconciler.handle_event(&ctx, &evt).unwrap(), EventOutcome::Duplicate);
        assert_eq!(f.backend.stats().unwrap().pending_count, 1);
        assert_eq!(f.backend.stats().unwrap().delivery_count, 1);
    }

    #[test]
    fn test_failed_delivery_is_not_recorded() {
        let f = fixture();
        let ctx = RequestContext::new();
        let evt = event(
            "evt_1",
            EventKind::PaymentCompleted(payment("unknown@x.com", "cus_2")),
        );

        f.backend.fail_writes.store(true, Ordering::SeqCst);
        assert!(f.reconciler.handle_event(&ctx, &evt).is_err());
        assert!(!f.backend.delivery_processed("evt_1").unwrap());

        f.backend.fail_writes.store(false, Ordering::SeqCst);
        assert!(matches!(
            f.reconciler.handle_event(&ctx, &evt).unwrap(),
            EventOutcome::Reconciled(ReconcileOutcome::Pending { .. })
        ));
        assert!(f.backend.delivery_processed("evt_1").unwrap());
    }

    #[test]
    fn test_ledger_failure_allows_safe_retry() {
        let f = fixture();
        let ctx = RequestContext::new();
        let evt = event(
            "evt_1",
            EventKind::PaymentCompleted(payment("unknown@x.com", "cus_2")),
        );

        f.backend.fail_ledger.store(true, Ordering::SeqCst);
        assert!(f.reconciler.handle_event(&ctx, &evt).is_err());

        f.backend.fail_ledger.store(false, Ordering::SeqCst);
        assert!(matches!(
            f.reconciler.handle_event(&ctx, &evt).unwrap(),
            EventOutcome::Reconciled(ReconcileOutcome::AlreadyPending { .. })
        ));
        assert_eq!(f.backend.stats().unwrap().pending_count, 1);
    }

    #[test]
    fn test_informational_and_unknown_events() {
        let f = fixture();
        let ctx = RequestContext::new();

        let invoice = event(
            "evt_2",
            EventKind::InvoicePaid {
                invoice_id: Some("in_1".into()),
                customer_ref: Some("cus_1".into()),
            },
        );
        assert_eq!(f.reconciler.handle_event(&ctx, &invoice).unwrap(), EventOutcome::Logged);

        let created = event(
            "evt_3",
            EventKind::SubscriptionCreated {
                subscription_id: Some("sub_1".into()),
                customer_ref: None,
            },
        );
        assert_eq!(f.reconciler.handle_event(&ctx, &created).unwrap(), EventOutcome::Logged);

        let other = event("evt_4", EventKind::Other);
        assert_eq!(f.reconciler.handle_event(&ctx, &other).unwrap(), EventOutcome::Ignored);

        let stats = f.backend.stats().unwrap();
        assert_eq!(stats.delivery_count, 3);
        assert_eq!(stats.pending_count, 0);
    }
}
