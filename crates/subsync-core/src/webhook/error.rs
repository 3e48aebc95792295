//! Error types for the payment webhook.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::reconciler::ReconcileError;

/// Errors that can occur while processing a payment webhook delivery.
///
/// Anything that means "this delivery can never succeed" maps to 400 so the
/// processor stops retrying; persistence failures map to 500 so it retries.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The `Stripe-Signature` header is missing.
    #[error("missing signature header")]
    MissingSignature,

    /// The signature header could not be parsed.
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    /// No `v1` signature matched the payload.
    #[error("invalid signature")]
    InvalidSignature,

    /// The signed timestamp is outside the tolerance window.
    #[error("signature timestamp outside tolerance ({skew_secs}s skew)")]
    StaleTimestamp {
        /// Absolute difference between the signed time and now.
        skew_secs: u64,
    },

    /// The verified body is not a usable event.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Side effects could not be persisted; the delivery should be retried.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl WebhookError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSignature
            | Self::InvalidSignatureFormat(_)
            | Self::InvalidSignature
            | Self::StaleTimestamp { .. }
            | Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label for log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::InvalidSignatureFormat(_) => "invalid_signature_format",
            Self::InvalidSignature => "invalid_signature",
            Self::StaleTimestamp { .. } => "stale_timestamp",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Persistence(_) => "persistence",
        }
    }
}

impl From<ReconcileError> for WebhookError {
    fn from(err: ReconcileError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        // Signature failures share one body so callers cannot tell a bad
        // secret from a stale timestamp.
        let status = self.status_code();
        let body = match &self {
            Self::MissingSignature
            | Self::InvalidSignatureFormat(_)
            | Self::InvalidSignature
            | Self::StaleTimestamp { .. } => "Invalid signature",
            Self::InvalidPayload(_) => "Invalid payload",
            Self::Persistence(_) => "Internal server error",
        };

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    #[test]
    fn test_error_status_codes() {
        for err in [
            WebhookError::MissingSignature,
            WebhookError::InvalidSignatureFormat("t=".into()),
            WebhookError::InvalidSignature,
            WebhookError::StaleTimestamp { skew_secs: 900 },
            WebhookError::InvalidPayload("missing email".into()),
        ] {
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "{err}");
        }
        assert_eq!(
            WebhookError::Persistence("disk full".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_responses_do_not_leak_details() {
        let response = WebhookError::Persistence("secret database path".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Internal server error");

        let stale = WebhookError::StaleTimestamp { skew_secs: 900 }.into_response();
        let mismatch = WebhookError::InvalidSignature.into_response();
        let stale_body = to_bytes(stale.into_body(), usize::MAX).await.unwrap();
        let mismatch_body = to_bytes(mismatch.into_body(), usize::MAX).await.unwrap();
        assert_eq!(stale_body, mismatch_body);
    }
}
