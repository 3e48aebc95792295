//! Persistence for accounts, pending subscriptions, and processed webhook
//! deliveries.
//!
//! The [`SubscriptionBackend`] trait is the seam between the domain services
//! and storage. [`SqliteBackend`] is the production implementation: a single
//! `SQLite` database in WAL mode with the schema applied on open.
//!
//! # Invariants
//!
//! - Subscription fields on an account are written by exactly one code path,
//!   shared by [`SubscriptionBackend::update_subscription`] and
//!   [`SubscriptionBackend::claim_pending`].
//! - A pending subscription with a claimant is terminal; the schema rejects
//!   further updates and all deletes.
//! - [`SubscriptionBackend::claim_pending`] marks a row claimed with a
//!   conditional update (`claimed_by IS NULL`) inside the same transaction
//!   as the subscription write, so at most one claim per row can commit.
//!
//! # Example
//!
//! ```rust,no_run
//! use subsync_core::store::{SqliteBackend, SubscriptionBackend};
//!
//! # fn example() -> Result<(), subsync_core::store::StoreError> {
//! let backend = SqliteBackend::open("/var/lib/subsync/subsync.db")?;
//! let stats = backend.stats()?;
//! println!("{} accounts", stats.account_count);
//! # Ok(())
//! # }
//! ```

mod records;
mod sqlite;


pub use records::{
    Account, AccountId, ClaimAttempt, NewAccount, NewPending, PendingClaim, PendingId,
    PendingSubscription, StoreStats, SubscriptionStatus, SubscriptionUpdate, UniqueField,
};
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A unique column already holds the value.
    #[error("{field} already registered")]
    Conflict {
        /// The column that collided.
        field: UniqueField,
    },

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The connection mutex was poisoned by a panic elsewhere.
    #[error("storage lock poisoned")]
    LockPoisoned,
}

/// Storage operations needed by the account store, reconciler, and claim
/// workflow.
pub trait SubscriptionBackend: Send + Sync {
    /// Inserts an account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the email or username is taken.
    fn insert_account(&self, account: &NewAccount) -> Result<Account, StoreError>;

    /// Fetches an account by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn account_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Fetches an account by exact email.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError>;

    /// Fetches an account by exact username.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn account_by_username(&self, username: &str) -> Result<Option<Account>, StoreError>;

    /// Overwrites the subscription fields of an account.
    ///
    /// Returns `false` if no account has that id.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn update_subscription(
        &self,
        id: AccountId,
        update: &SubscriptionUpdate,
    ) -> Result<bool, StoreError>;

    /// Inserts a pending subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn insert_pending(&self, pending: &NewPending) -> Result<PendingSubscription, StoreError>;

    /// Fetches a pending subscription by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn pending_by_id(&self, id: PendingId) -> Result<Option<PendingSubscription>, StoreError>;

    /// Oldest unclaimed pending subscription for `email`, optionally
    /// restricted to one payment-customer reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn oldest_unclaimed(
        &self,
        email: &str,
        customer_ref: Option<&str>,
    ) -> Result<Option<PendingSubscription>, StoreError>;

    /// All pending subscriptions (claimed or not) recorded for `email`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn pending_for_email(&self, email: &str) -> Result<Vec<PendingSubscription>, StoreError>;

    /// Atomically claims the oldest unclaimed pending subscription for the
    /// claim's email and applies the subscription update to the claimant.
    ///
    /// Nothing is written unless both steps succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; the pending row then stays
    /// unclaimed.
    fn claim_pending(&self, claim: &PendingClaim<'_>) -> Result<ClaimAttempt, StoreError>;

    /// Whether a webhook event id has already been processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn delivery_processed(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Records a processed webhook event id. Recording the same id twice is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn record_delivery(
        &self,
        event_id: &str,
        event_kind: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Row counts for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn stats(&self) -> Result<StoreStats, StoreError>;
}
