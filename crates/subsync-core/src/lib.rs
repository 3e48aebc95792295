//! Core of the subsync service.
//!
//! This crate holds everything that decides what happens to a subscription:
//!
//! - [`account`]: registered users, credentials, and the subscription fields
//!   that gate paid features
//! - [`reconciler`]: turns payment-processor events into account updates or
//!   pending subscriptions
//! - [`claim`]: lets a signed-in user attach a pending subscription paid under
//!   a different email address
//! - [`session`]: bearer tokens for signed-in users
//! - [`webhook`]: signature verification and payload parsing for inbound
//!   processor events
//! - [`store`]: the `SQLite` backend behind all of the above
//!
//! Every operation that reads the time takes it from an injected
//! [`clock::Clock`], and every operation that acts on behalf of a request
//! receives an explicit [`context::RequestContext`].

pub mod account;
pub mod claim;
pub mod clock;
pub mod config;
pub mod context;
pub mod credentials;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod webhook;

pub use account::{AccountError, AccountStore, SubscriptionPolicy};
pub use claim::{ClaimError, ClaimReceipt, ClaimWorkflow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SubsyncConfig};
pub use context::{Identity, RequestContext};
pub use reconciler::{EventOutcome, ReconcileError, ReconcileOutcome, Reconciler};
pub use session::{SessionError, SessionRegistry};
pub use store::{SqliteBackend, StoreError, SubscriptionBackend};
