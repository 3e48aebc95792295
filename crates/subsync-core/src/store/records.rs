//! Row types for the subscription store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::credentials::PasswordCredential;

/// Primary key of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Primary key of a pending subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingId(pub i64);

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stored subscription flag.
///
/// `Active` alone does not mean the subscription is usable; see
/// [`Account::is_active_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// No paid access.
    #[default]
    Inactive,
    /// Paid access until the expiry timestamp.
    Active,
}

impl SubscriptionStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            other => Err(StoreError::Corrupt(format!(
                "unknown subscription status {other:?}"
            ))),
        }
    }
}

/// Column that must be unique across accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    /// `accounts.email`
    Email,
    /// `accounts.username`
    Username,
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Email => "email",
            Self::Username => "username",
        })
    }
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Assigned by the store.
    pub id: AccountId,
    /// Unique, matched exactly.
    pub email: String,
    /// Unique login name.
    pub username: String,
    /// Opaque password credential.
    pub credential: PasswordCredential,
    /// Display name.
    pub name: String,
    /// Payment processor customer the subscription was last paid by.
    pub payment_customer_ref: Option<String>,
    /// Stored flag; see [`Account::is_active_at`].
    pub status: SubscriptionStatus,
    /// When the current subscription period ends.
    pub expires_at: Option<DateTime<Utc>>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// A subscription is usable only while flagged active and unexpired.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.expires_at.is_some_and(|end| end > now)
    }
}

/// Fields for a new account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub username: String,
    pub credential: PasswordCredential,
    pub name: String,
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// New values for an account's subscription fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// Overwrites the stored customer reference when `Some`; `None` keeps it.
    pub payment_customer_ref: Option<String>,
    pub status: SubscriptionStatus,
    pub expires_at: DateTime<Utc>,
}

/// A payment that matched no account when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubscription {
    pub id: PendingId,
    pub payment_email: String,
    pub payment_customer_ref: String,
    pub paid_at: DateTime<Utc>,
    pub claimed_by: Option<AccountId>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl PendingSubscription {
    /// Claimed rows are terminal.
    #[must_use]
    pub const fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }
}

/// Fields for a new pending subscription.
#[derive(Debug, Clone)]
pub struct NewPending {
    pub payment_email: String,
    pub payment_customer_ref: String,
    pub paid_at: DateTime<Utc>,
}

/// Input to [`super::SubscriptionBackend::claim_pending`].
///
/// The subscription update's customer reference is taken from the claimed
/// row, so `update.payment_customer_ref` is ignored.
#[derive(Debug, Clone)]
pub struct PendingClaim<'a> {
    pub payment_email: &'a str,
    pub claimant: AccountId,
    pub update: &'a SubscriptionUpdate,
    pub claimed_at: DateTime<Utc>,
}

/// What happened to a claim transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    /// The row is now claimed and the claimant's subscription updated.
    Claimed(PendingSubscription),
    /// No unclaimed row for that email, or another claim got there first.
    NothingToClaim,
    /// The claimant's account does not exist; nothing was written.
    ClaimantMissing,
}

/// Row counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub account_count: u64,
    pub active_flag_count: u64,
    pub pending_count: u64,
    pub unclaimed_count: u64,
    pub delivery_count: u64,
    pub schema_version: u32,
}
