//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use subsync_core::{AccountError, ClaimError, SessionError, StoreError};
use thiserror::Error;

/// Errors returned by the JSON API.
///
/// Bodies carry a fixed message per variant; internal details only reach
/// the log.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, unknown, or expired bearer token, or failed login.
    #[error("unauthorized")]
    Unauthorized,

    /// The request body or a field in it is unusable.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No unclaimed subscription for the email.
    #[error("not found")]
    NotFound,

    /// Email or username already registered.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The session registry is full.
    #[error("service unavailable")]
    Unavailable,

    /// Anything the client cannot fix.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Self::Internal(detail) = &self {
            tracing::error!(error = %detail, "request failed");
        }
        let message = match &self {
            Self::Unauthorized => "unauthorized",
            Self::BadRequest(reason) | Self::Conflict(reason) => reason.as_str(),
            Self::NotFound => "no unclaimed subscription for this email",
            Self::Unavailable => "service unavailable",
            Self::Internal(_) => "internal server error",
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::DuplicateAccount { .. } => Self::Conflict(err.to_string()),
            AccountError::InvalidInput(reason) => Self::BadRequest(reason),
            AccountError::Credential(_) | AccountError::Storage(_) => {
                Self::Internal(err.to_string())
            },
        }
    }
}

impl From<ClaimError> for ApiError {
    fn from(err: ClaimError) -> Self {
        match err {
            ClaimError::Unauthenticated => Self::Unauthorized,
            ClaimError::InvalidEmail(reason) => Self::BadRequest(reason),
            ClaimError::NotFound => Self::NotFound,
            ClaimError::UpdateFailed { .. } | ClaimError::Storage(_) => {
                Self::Internal(err.to_string())
            },
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::CapacityExceeded { .. } => Self::Unavailable,
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}
