//! Request context extraction.
//!
//! Every handler receives a [`RequestContext`]. [`Anonymous`] only carries
//! the trace id; [`Authenticated`] additionally resolves the bearer token
//! and rejects the request with 401 when that fails.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use subsync_core::RequestContext;

use crate::app::AppState;
use crate::error::ApiError;

/// Header a caller or proxy can set to correlate logs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn base_context(parts: &Parts) -> RequestContext {
    RequestContext::from_request_id(
        parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    )
}

/// Returns the token from an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Context for a request that needs no signed-in user.
#[derive(Debug, Clone)]
pub struct Anonymous(pub RequestContext);

#[async_trait]
impl FromRequestParts<AppState> for Anonymous {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, ApiError> {
        Ok(Self(base_context(parts)))
    }
}

/// Context carrying the identity behind a valid bearer token, plus the
/// token itself for sign-out.
#[derive(Clone)]
pub struct Authenticated {
    pub ctx: RequestContext,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let ctx = base_context(parts);
        let Some(token) = bearer_token(parts) else {
            tracing::debug!(trace_id = %ctx.trace_id(), "missing bearer token");
            return Err(ApiError::Unauthorized);
        };
        let Some(identity) = state.sessions.resolve(token) else {
            tracing::info!(
                trace_id = %ctx.trace_id(),
                operation = "resolve_session",
                outcome = "rejected",
                "unknown or expired session"
            );
            return Err(ApiError::Unauthorized);
        };
        Ok(Self {
            ctx: ctx.authenticated(identity),
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/subscription");
        if let Some(value) = header {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&parts(Some("Bearer abc123"))), Some("abc123"));
        assert_eq!(bearer_token(&parts(Some("bearer abc123"))), Some("abc123"));
        assert_eq!(bearer_token(&parts(Some("Basic abc123"))), None);
        assert_eq!(bearer_token(&parts(Some("Bearer "))), None);
        assert_eq!(bearer_token(&parts(Some("abc123"))), None);
        assert_eq!(bearer_token(&parts(None)), None);
    }
}
