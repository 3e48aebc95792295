//! Bearer sessions for signed-in users.
//!
//! A session token is 32 random bytes, hex-encoded, handed to the client
//! once. The registry keeps only the SHA-256 digest of each token, so a
//! memory dump cannot be replayed as a login.
//!
//! # Capacity
//!
//! The registry holds at most `max_sessions` entries. When full, expired
//! entries are purged; if it is still full, [`SessionRegistry::issue`]
//! fails rather than evicting a live session.
//!
//! # Thread Safety
//!
//! All state sits behind one `RwLock`. A panic while holding it does not
//! leave a half-applied map update, so a poisoned lock is recovered.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::clock::Clock;
use crate::context::Identity;
use crate::store::AccountId;

/// Random bytes per token.
const TOKEN_BYTES: usize = 32;

/// Errors from the session registry.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The registry is full of unexpired sessions.
    #[error("session capacity of {max} reached")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },
}

/// Bearer token returned to the client once.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// The token text for the `Authorization` header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// A freshly issued session.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: SessionToken,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    identity: Identity,
    expires_at: DateTime<Utc>,
}

/// Live sessions keyed by token digest.
pub struct SessionRegistry {
    entries: RwLock<HashMap<[u8; 32], SessionEntry>>,
    ttl: TimeDelta,
    max_sessions: usize,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("ttl", &self.ttl)
            .field("max_sessions", &self.max_sessions)
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(ttl: TimeDelta, max_sessions: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_sessions,
            clock,
        }
    }

    /// Starts a session for `account_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CapacityExceeded`] if the registry is full of
    /// unexpired sessions.
    pub fn issue(
        &self,
        account_id: AccountId,
        username: &str,
    ) -> Result<IssuedSession, SessionError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if entries.len() >= self.max_sessions {
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= self.max_sessions {
                tracing::warn!(
                    max_sessions = self.max_sessions,
                    "session registry full"
                );
                return Err(SessionError::CapacityExceeded {
                    max: self.max_sessions,
                });
            }
        }

        let token = SessionToken::generate();
        let expires_at = now + self.ttl;
        entries.insert(
            digest(token.as_str()),
            SessionEntry {
                identity: Identity {
                    account_id,
                    username: username.to_string(),
                },
                expires_at,
            },
        );
        tracing::debug!(account_id = %account_id, %expires_at, "session issued");

        Ok(IssuedSession { token, expires_at })
    }

    /// Looks up the identity behind a token.
    ///
    /// Unknown and expired tokens both resolve to `None`; an expired entry is
    /// removed on the way.
    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<Identity> {
        let key = digest(token);
        let now = self.clock.now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&key) {
                None => return None,
                Some(entry) if entry.expires_at > now => return Some(entry.identity.clone()),
                Some(_) => {},
            }
        }

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        None
    }

    /// Ends a session. Returns `true` if the token was live.
    pub fn revoke(&self, token: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&digest(token))
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Number of stored sessions, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no sessions are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(max: usize) -> (SessionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        (
            SessionRegistry::new(TimeDelta::hours(1), max, clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_issue_and_resolve() {
        let (registry, _clock) = registry(10);
        let issued = registry.issue(AccountId(1), "ayesha").unwrap();

        assert_eq!(issued.token.as_str().len(), TOKEN_BYTES * 2);
        let identity = registry.resolve(issued.token.as_str()).unwrap();
        assert_eq!(identity.account_id, AccountId(1));
        assert_eq!(identity.username, "ayesha");
        assert!(registry.resolve("not-a-token").is_none());
    }

    #[test]
    fn test_tokens_are_unique() {
        let (registry, _clock) = registry(10);
        let a = registry.issue(AccountId(1), "ayesha").unwrap();
        let b = registry.issue(AccountId(1), "ayesha").unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_expired_session_is_rejected_and_purged() {
        let (registry, clock) = registry(10);
        let issued = registry.issue(AccountId(1), "ayesha").unwrap();

        clock.advance(TimeDelta::hours(1));
        assert!(registry.resolve(issued.token.as_str()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_revoke() {
        let (registry, _clock) = registry(10);
        let issued = registry.issue(AccountId(1), "ayesha").unwrap();

        assert!(registry.revoke(issued.token.as_str()));
        assert!(registry.resolve(issued.token.as_str()).is_none());
        assert!(!registry.revoke(issued.token.as_str()));
    }

    #[test]
    fn test_capacity_purges_expired_before_refusing() {
        let (registry, clock) = registry(2);
        registry.issue(AccountId(1), "a").unwrap();
        registry.issue(AccountId(2), "b").unwrap();
        assert!(matches!(
            registry.issue(AccountId(3), "c"),
            Err(SessionError::CapacityExceeded { max: 2 })
        ));

        clock.advance(TimeDelta::hours(2));
        let issued = registry.issue(AccountId(3), "c").unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(issued.token.as_str()).is_some());
    }

    #[test]
    fn test_debug_does_not_print_tokens() {
        let (registry, _clock) = registry(10);
        let issued = registry.issue(AccountId(1), "ayesha").unwrap();
        assert!(!format!("{issued:?}").contains(issued.token.as_str()));
        assert!(!format!("{registry:?}").contains(issued.token.as_str()));
    }
}
