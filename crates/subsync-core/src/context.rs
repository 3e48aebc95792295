//! Request-scoped context.
//!
//! A [`RequestContext`] is created once per inbound request and handed to
//! every operation that runs on its behalf. It carries the trace id that ties
//! log lines together and, once a bearer token has been resolved, the
//! identity of the signed-in user.

use uuid::Uuid;

use crate::store::AccountId;

/// The signed-in user a request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account the session belongs to.
    pub account_id: AccountId,
    /// Username at the time the session was resolved.
    pub username: String,
}

/// Per-request state passed explicitly into core operations.
#[derive(Debug, Clone)]
pub struct RequestContext {
    trace_id: Uuid,
    identity: Option<Identity>,
}

impl RequestContext {
    /// Creates an anonymous context with a fresh trace id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_trace_id(Uuid::new_v4())
    }

    /// Creates an anonymous context with the given trace id.
    #[must_use]
    pub const fn with_trace_id(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            identity: None,
        }
    }

    /// Reuses a caller-supplied request id when it is a UUID, otherwise
    /// generates one.
    #[must_use]
    pub fn from_request_id(request_id: Option<&str>) -> Self {
        request_id
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map_or_else(Self::new, Self::with_trace_id)
    }

    /// Attaches the signed-in user.
    #[must_use]
    pub fn authenticated(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Trace id for log correlation.
    #[must_use]
    pub const fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// The signed-in user, if any.
    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
