//! Claiming pending subscriptions.
//!
//! A payment made under an email that matches no account is parked as a
//! pending subscription. A signed-in user who knows that email can claim it,
//! which activates their own account with the parked customer reference.
//!
//! # Invariants
//!
//! - A pending subscription is claimed at most once. Marking it claimed is a
//!   conditional update inside the same transaction as the account update,
//!   so two concurrent claims cannot both succeed.
//! - If the account update fails, nothing is written and the row stays
//!   claimable.
//! - With several unclaimed rows for one email, the oldest is claimed first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::account::{AccountStore, validate_email};
use crate::clock::Clock;
use crate::context::RequestContext;
use crate::store::{
    AccountId, ClaimAttempt, PendingClaim, PendingId, StoreError, SubscriptionBackend,
    SubscriptionStatus,
};

/// Errors from [`ClaimWorkflow::claim`].
#[derive(Debug, Error)]
pub enum ClaimError {
    /// The request carries no signed-in user.
    #[error("claiming requires a signed-in user")]
    Unauthenticated,

    /// The email is not a plausible address.
    #[error("invalid email: {0}")]
    InvalidEmail(String),

    /// No unclaimed pending subscription exists for the email.
    #[error("no unclaimed subscription for this email")]
    NotFound,

    /// The claimant's account could not be updated; nothing was claimed.
    #[error("subscription update failed for account {account_id}")]
    UpdateFailed {
        /// The signed-in account.
        account_id: AccountId,
    },

    /// The claim transaction failed and was rolled back.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// What a successful claim did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReceipt {
    /// The row that is now claimed.
    pub pending_id: PendingId,
    /// The account that claimed it.
    pub account_id: AccountId,
    /// Customer reference copied onto the account.
    pub payment_customer_ref: String,
    /// End of the newly started period.
    pub expires_at: DateTime<Utc>,
}

/// Attaches pending subscriptions to signed-in accounts.
pub struct ClaimWorkflow {
    accounts: Arc<AccountStore>,
    backend: Arc<dyn SubscriptionBackend>,
    clock: Arc<dyn Clock>,
}

impl ClaimWorkflow {
    /// Creates a claim workflow over the same backend the account store uses.
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

    /// Claims the oldest unclaimed pending subscription paid under
    /// `payment_email` for the signed-in user in `ctx`.
    ///
    /// # Errors
    ///
    /// - [`ClaimError::Unauthenticated`] if `ctx` has no identity
    /// - [`ClaimError::InvalidEmail`] if the email is malformed
    /// - [`ClaimError::NotFound`] if nothing is claimable, including when a
    ///   concurrent claim took the last row
    /// - [`ClaimError::UpdateFailed`] if the claimant's account is gone
    /// - [`ClaimError::Storage`] if the transaction failed
    pub fn claim(
        &self,
        ctx: &RequestContext,
        payment_email: &str,
    ) -> Result<ClaimReceipt, ClaimError> {
        let identity = ctx.identity().ok_or(ClaimError::Unauthenticated)?;
        validate_email(payment_email).map_err(|err| ClaimError::InvalidEmail(err.to_string()))?;

        let update = self
            .accounts
            .subscription_update(None, SubscriptionStatus::Active, None);
        let attempt = self.backend.claim_pending(&PendingClaim {
            payment_email,
            claimant: identity.account_id,
            update: &update,
            claimed_at: self.clock.now(),
        });

        let result = match attempt {
            Ok(ClaimAttempt::Claimed(row)) => Ok(ClaimReceipt {
                pending_id: row.id,
                account_id: identity.account_id,
                payment_customer_ref: row.payment_customer_ref,
                expires_at: update.expires_at,
            }),
            Ok(ClaimAttempt::NothingToClaim) => Err(ClaimError::NotFound),
            Ok(ClaimAttempt::ClaimantMissing) => Err(ClaimError::UpdateFailed {
                account_id: identity.account_id,
            }),
            Err(err) => Err(ClaimError::Storage(err)),
        };

        match &result {
            Ok(receipt) => tracing::info!(
                trace_id = %ctx.trace_id(),
                operation = "claim",
                outcome = "claimed",
                account_id = %receipt.account_id,
                pending_id = %receipt.pending_id,
                expires_at = %receipt.expires_at,
                "pending subscription claimed"
            ),
            Err(ClaimError::NotFound) => tracing::info!(
                trace_id = %ctx.trace_id(),
                operation = "claim",
                outcome = "not_found",
                account_id = %identity.account_id,
                "nothing to claim"
            ),
            Err(err) => tracing::error!(
                trace_id = %ctx.trace_id(),
                operation = "claim",
                outcome = "failed",
                account_id = %identity.account_id,
                error = %err,
                "claim failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use chrono::TimeDelta;
    use secrecy::SecretString;

    use super::*;
    use crate::account::SubscriptionPolicy;
    use crate::clock::ManualClock;
    use crate::context::Identity;
    use crate::credentials::Argon2Hasher;
    use crate::store::{Account, NewPending, SqliteBackend};

    const START: i64 = 1_700_000_000;

    struct Fixture {
        backend: Arc<SqliteBackend>,
        accounts: Arc<AccountStore>,
        workflow: Arc<ClaimWorkflow>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(SqliteBackend::in_memory().unwrap());
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
        let workflow = Arc::new(ClaimWorkflow::new(
            accounts.clone(),
            backend.clone(),
            clock.clone(),
        ));
        Fixture {
            backend,
            accounts,
            workflow,
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

    fn signed_in(account: &Account) -> RequestContext {
        RequestContext::new().authenticated(Identity {
            account_id: account.id,
            username: account.username.clone(),
        })
    }

    fn park(f: &Fixture, email: &str, customer: &str) -> PendingId {
        f.backend
            .insert_pending(&NewPending {
                payment_email: email.to_string(),
                payment_customer_ref: customer.to_string(),
                paid_at: f.clock.now(),
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_claim_activates_claimant() {
        let f = fixture();
        let ayesha = register(&f, "a@x.com", "ayesha");
        let pending_id = park(&f, "unknown@x.com", "cus_9");
        f.clock.advance(TimeDelta::hours(1));

        let receipt = f.workflow.claim(&signed_in(&ayesha), "unknown@x.com").unwrap();

        assert_eq!(receipt.pending_id, pending_id);
        assert_eq!(receipt.account_id, ayesha.id);
        assert_eq!(receipt.payment_customer_ref, "cus_9");
        assert_eq!(
            receipt.expires_at.timestamp(),
            START + 3_600 + 30 * 86_400
        );

        let account = f.accounts.get(ayesha.id).unwrap().unwrap();
        assert!(f.accounts.is_subscription_active(ayesha.id).unwrap());
        assert_eq!(account.payment_customer_ref.as_deref(), Some("cus_9"));

        let row = f.backend.pending_by_id(pending_id).unwrap().unwrap();
        assert_eq!(row.claimed_by, Some(ayesha.id));
        assert_eq!(row.claimed_at.map(|t| t.timestamp()), Some(START + 3_600));
    }

    #[test]
    fn test_second_claim_finds_nothing() {
        let f = fixture();
        let ayesha = register(&f, "a@x.com", "ayesha");
        park(&f, "unknown@x.com", "cus_9");

        f.workflow.claim(&signed_in(&ayesha), "unknown@x.com").unwrap();
        assert!(matches!(
            f.workflow.claim(&signed_in(&ayesha), "unknown@x.com"),
            Err(ClaimError::NotFound)
        ));
    }

    #[test]
    fn test_oldest_row_is_claimed_first() {
        let f = fixture();
        let ayesha = register(&f, "a@x.com", "ayesha");
        let first = park(&f, "unknown@x.com", "cus_old");
        f.clock.advance(TimeDelta::days(2));
        let second = park(&f, "unknown@x.com", "cus_new");

        let ctx = signed_in(&ayesha);
        assert_eq!(f.workflow.claim(&ctx, "unknown@x.com").unwrap().pending_id, first);
        assert_eq!(f.workflow.claim(&ctx, "unknown@x.com").unwrap().pending_id, second);
    }

    #[test]
    fn test_claim_requires_identity_and_valid_email() {
        let f = fixture();
        let ayesha = register(&f, "a@x.com", "ayesha");
        park(&f, "unknown@x.com", "cus_9");

        assert!(matches!(
            f.workflow.claim(&RequestContext::new(), "unknown@x.com"),
            Err(ClaimError::Unauthenticated)
        ));
        assert!(matches!(
            f.workflow.claim(&signed_in(&ayesha), "nonsense"),
            Err(ClaimError::InvalidEmail(_))
        ));
        assert_eq!(f.backend.stats().unwrap().unclaimed_count, 1);
    }

    #[test]
    fn test_missing_claimant_leaves_row_unclaimed() {
        let f = fixture();
        let pending_id = park(&f, "unknown@x.com", "cus_9");
        let ghost = RequestContext::new().authenticated(Identity {
            account_id: AccountId(404),
            username: "ghost".into(),
        });

        assert!(matches!(
            f.workflow.claim(&ghost, "unknown@x.com"),
            Err(ClaimError::UpdateFailed { account_id: AccountId(404) })
        ));
        assert!(!f.backend.pending_by_id(pending_id).unwrap().unwrap().is_claimed());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let f = fixture();
        let claimants: Vec<Account> = (0..8)
            .map(|i| register(&f, &format!("user{i}@x.com"), &format!("user{i}")))
            .collect();
        park(&f, "unknown@x.com", "cus_9");

        let barrier = Arc::new(Barrier::new(claimants.len()));
        let handles: Vec<_> = claimants
            .iter()
            .map(|account| {
                let workflow = Arc::clone(&f.workflow);
                let barrier = Arc::clone(&barrier);
                let ctx = signed_in(account);
                thread::spawn(move || {
                    barrier.wait();
                    workflow.claim(&ctx, "unknown@x.com")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, ClaimError::NotFound))
        );

        let active = claimants
            .iter()
            .filter(|a| f.accounts.is_subscription_active(a.id).unwrap())
            .count();
        assert_eq!(active, 1);
    }
}
