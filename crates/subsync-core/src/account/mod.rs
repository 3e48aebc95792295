//! Account store.
//!
//! [`AccountStore`] owns registration, password authentication, and the
//! subscription fields of an account. It is the only component that decides
//! what a subscription update looks like: [`AccountStore::set_subscription`]
//! for direct updates and [`AccountStore::subscription_update`] for the
//! claim workflow, which must apply the update inside its own transaction.
//!
//! A subscription counts as active only while the stored status is
//! `active` and the expiry lies in the future. Nothing caches that answer;
//! [`AccountStore::is_subscription_active`] reads the row and the clock on
//! every call.

mod validate;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;
use crate::context::RequestContext;
use crate::credentials::{CredentialError, CredentialHasher, PasswordCredential};
use crate::store::{
    Account, AccountId, NewAccount, StoreError, SubscriptionBackend, SubscriptionStatus,
    SubscriptionUpdate, UniqueField,
};

pub use validate::{
    MAX_EMAIL_LEN, MAX_NAME_LEN, MAX_USERNAME_LEN, MIN_PASSWORD_LEN, validate_email,
};

/// Password verified when the username does not exist, so both failure
/// paths cost one hash verification.
const DUMMY_PASSWORD: &str = "subsync-timing-equalizer";

/// Errors from account operations.
#[derive(Debug, Error)]
pub enum AccountError {
    /// The email or username is already registered.
    #[error("an account with this {field} already exists")]
    DuplicateAccount {
        /// Which unique field collided.
        field: UniqueField,
    },

    /// A registration field failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The password could not be turned into a credential.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Storage failed.
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for AccountError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { field } => Self::DuplicateAccount { field },
            other => Self::Storage(other),
        }
    }
}

/// How long subscriptions last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionPolicy {
    /// Length of one paid period; used when a caller gives no duration.
    pub period: TimeDelta,
    /// Active period granted at registration, if any.
    pub signup_trial: Option<TimeDelta>,
}

impl Default for SubscriptionPolicy {
    fn default() -> Self {
        Self {
            period: TimeDelta::days(30),
            signup_trial: None,
        }
    }
}

/// Subscription state of an account as seen at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    /// Stored flag.
    pub status: SubscriptionStatus,
    /// End of the current period.
    pub expires_at: Option<DateTime<Utc>>,
    /// Flag and expiry evaluated against the clock.
    pub active: bool,
}

/// Registered users and their subscription fields.
pub struct AccountStore {
    backend: Arc<dyn SubscriptionBackend>,
    hasher: Arc<dyn CredentialHasher>,
    clock: Arc<dyn Clock>,
    policy: SubscriptionPolicy,
    dummy_credential: PasswordCredential,
}

impl AccountStore {
    /// Creates an account store.
    ///
    /// # Errors
    ///
    /// Returns an error if the hasher cannot produce the credential used to
    /// equalize authentication timing.
    pub fn new(
        backend: Arc<dyn SubscriptionBackend>,
        hasher: Arc<dyn CredentialHasher>,
        clock: Arc<dyn Clock>,
        policy: SubscriptionPolicy,
    ) -> Result<Self, CredentialError> {
        let dummy_credential = hasher.hash(&SecretString::from(DUMMY_PASSWORD))?;
        Ok(Self {
            backend,
            hasher,
            clock,
            policy,
            dummy_credential,
        })
    }

    /// The subscription policy in force.
    #[must_use]
    pub const fn policy(&self) -> SubscriptionPolicy {
        self.policy
    }

    /// Registers a new account.
    ///
    /// The account starts inactive unless the policy grants a signup trial.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidInput`] if a field fails validation
    /// - [`AccountError::DuplicateAccount`] if the email or username is taken
    /// - [`AccountError::Credential`] or [`AccountError::Storage`] on
    ///   infrastructure failures
    pub fn create_account(
        &self,
        ctx: &RequestContext,
        email: &str,
        username: &str,
        password: &SecretString,
        name: &str,
    ) -> Result<Account, AccountError> {
        validate::registration(email, username, password, name)?;

        let now = self.clock.now();
        let (status, expires_at) = match self.policy.signup_trial {
            Some(trial) => (SubscriptionStatus::Active, Some(now + trial)),
            None => (SubscriptionStatus::Inactive, None),
        };
        let new = NewAccount {
            email: email.to_string(),
            username: username.to_string(),
            credential: self.hasher.hash(password)?,
            name: name.to_string(),
            status,
            expires_at,
            created_at: now,
        };

        match self.backend.insert_account(&new) {
            Ok(account) => {
                tracing::info!(
                    trace_id = %ctx.trace_id(),
                    operation = "create_account",
                    outcome = "created",
                    account_id = %account.id,
                    trial = self.policy.signup_trial.is_some(),
                    "account created"
                );
                Ok(account)
            },
            Err(err) => {
                let err = AccountError::from(err);
                tracing::info!(
                    trace_id = %ctx.trace_id(),
                    operation = "create_account",
                    outcome = "rejected",
                    error = %err,
                    "account not created"
                );
                Err(err)
            },
        }
    }

    /// Checks a username and password.
    ///
    /// Returns `None` for an unknown username and for a wrong password alike.
    /// Both paths run one credential verification so they take comparable
    /// time.
    ///
    /// # Errors
    ///
    /// Returns an error only if storage fails.
    pub fn authenticate(
        &self,
        ctx: &RequestContext,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<Account>, StoreError> {
        let account = self.backend.account_by_username(username)?;
        let credential = account
            .as_ref()
            .map_or(&self.dummy_credential, |a| &a.credential);
        let verified = self.hasher.verify(password, credential);

        let result = account.filter(|_| verified);
        tracing::info!(
            trace_id = %ctx.trace_id(),
            operation = "authenticate",
            outcome = if result.is_some() { "accepted" } else { "rejected" },
            "authentication attempt"
        );
        Ok(result)
    }

    /// Builds the subscription fields for a period starting now.
    ///
    /// The expiry is `now + duration` (the policy period when `None`),
    /// regardless of any time left on a previous period.
    #[must_use]
    pub fn subscription_update(
        &self,
        payment_customer_ref: Option<&str>,
        status: SubscriptionStatus,
        duration: Option<TimeDelta>,
    ) -> SubscriptionUpdate {
        SubscriptionUpdate {
            payment_customer_ref: payment_customer_ref.map(str::to_string),
            status,
            expires_at: self.clock.now() + duration.unwrap_or(self.policy.period),
        }
    }

    /// Sets an account's subscription status with a fresh expiry.
    ///
    /// Calling this again restarts the period from now; renewals do not
    /// stack. Returns `false` if the account does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn set_subscription(
        &self,
        ctx: &RequestContext,
        account_id: AccountId,
        payment_customer_ref: Option<&str>,
        status: SubscriptionStatus,
        duration: Option<TimeDelta>,
    ) -> Result<bool, StoreError> {
        let update = self.subscription_update(payment_customer_ref, status, duration);
        self.apply_subscription(ctx, account_id, &update)
    }

    /// Writes subscription fields built by [`Self::subscription_update`].
    ///
    /// Returns `false` if the account does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn apply_subscription(
        &self,
        ctx: &RequestContext,
        account_id: AccountId,
        update: &SubscriptionUpdate,
    ) -> Result<bool, StoreError> {
        let updated = self.backend.update_subscription(account_id, update)?;

        tracing::info!(
            trace_id = %ctx.trace_id(),
            operation = "set_subscription",
            outcome = if updated { "updated" } else { "missing_account" },
            account_id = %account_id,
            status = %update.status,
            expires_at = %update.expires_at,
            "subscription set"
        );
        Ok(updated)
    }

    /// Whether the account's subscription is active right now.
    ///
    /// Unknown accounts are not active.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn is_subscription_active(&self, account_id: AccountId) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .account_by_id(account_id)?
            .is_some_and(|account| account.is_active_at(self.clock.now())))
    }

    /// Subscription state of an account, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn subscription(
        &self,
        account_id: AccountId,
    ) -> Result<Option<SubscriptionView>, StoreError> {
        Ok(self
            .backend
            .account_by_id(account_id)?
            .map(|account| self.view_of(&account)))
    }

    /// Subscription state of an already loaded account, evaluated now.
    #[must_use]
    pub fn view_of(&self, account: &Account) -> SubscriptionView {
        SubscriptionView {
            status: account.status,
            expires_at: account.expires_at,
            active: account.is_active_at(self.clock.now()),
        }
    }

    /// Fetches an account by id.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get(&self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        self.backend.account_by_id(account_id)
    }

    /// Fetches an account by exact email.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        self.backend.account_by_email(email)
    }

    /// Fetches an account by username.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        self.backend.account_by_username(username)
    }
}
