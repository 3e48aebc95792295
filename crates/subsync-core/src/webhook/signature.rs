//! `Stripe-Signature` verification.
//!
//! The header looks like `t=1700000000,v1=<hex>,v1=<hex>`. Each `v1` value is
//! an HMAC-SHA256 over `"<t>.<raw body>"` keyed with the endpoint secret; any
//! one match accepts. Unknown schemes (`v0`, ...) are ignored.

use std::sync::Arc;

use chrono::TimeDelta;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::WebhookError;
use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Signed Unix timestamp.
    pub timestamp: i64,
    /// Decoded `v1` signatures.
    pub signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    /// Parses a header value.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidSignatureFormat`] if the timestamp is
    /// missing or not a number, a `v1` value is not hex, or there is no `v1`
    /// value at all.
    pub fn parse(header: &str) -> Result<Self, WebhookError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                return Err(WebhookError::InvalidSignatureFormat(
                    "expected key=value pairs".into(),
                ));
            };
            match key {
                "t" => {
                    let parsed = value.parse::<i64>().map_err(|_| {
                        WebhookError::InvalidSignatureFormat("timestamp is not a number".into())
                    })?;
                    timestamp = Some(parsed);
                },
                "v1" => {
                    let decoded = hex::decode(value).map_err(|_| {
                        WebhookError::InvalidSignatureFormat("v1 signature is not hex".into())
                    })?;
                    signatures.push(decoded);
                },
                _ => {},
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| WebhookError::InvalidSignatureFormat("missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(WebhookError::InvalidSignatureFormat(
                "missing v1 signature".into(),
            ));
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Checks webhook deliveries against the shared endpoint secret.
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// Creates a verifier accepting timestamps within `tolerance` of the clock.
    #[must_use]
    pub fn new(secret: SecretString, tolerance: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret,
            tolerance,
            clock,
        }
    }

    /// Verifies `body` against the raw header value.
    ///
    /// Runs before the body is parsed; nothing in an unverified payload is
    /// trusted.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::MissingSignature`] if `header` is `None`
    /// - [`WebhookError::InvalidSignatureFormat`] if it cannot be parsed
    /// - [`WebhookError::StaleTimestamp`] if the signed time is too far from
    ///   now in either direction
    /// - [`WebhookError::InvalidSignature`] if no signature matches
    pub fn verify(&self, header: Option<&str>, body: &[u8]) -> Result<(), WebhookError> {
        let header = SignatureHeader::parse(header.ok_or(WebhookError::MissingSignature)?)?;

        let skew_secs = self.clock.now().timestamp().abs_diff(header.timestamp);
        if skew_secs > self.tolerance.num_seconds().unsigned_abs() {
            return Err(WebhookError::StaleTimestamp { skew_secs });
        }

        let expected = compute_signature(
            self.secret.expose_secret().as_bytes(),
            header.timestamp,
            body,
        )?;
        let matched = header
            .signatures
            .iter()
            .any(|candidate| bool::from(candidate.as_slice().ct_eq(expected.as_slice())));
        if matched {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

fn compute_signature(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<Vec<u8>, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| WebhookError::InvalidSignatureFormat(format!("unusable secret: {err}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Builds a header value the way the processor signs deliveries.
///
/// Used by tests and local tooling that replay events.
///
/// # Errors
///
/// Returns an error only if the HMAC cannot be keyed.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, WebhookError> {
    let signature = compute_signature(secret.as_bytes(), timestamp, body)?;
    Ok(format!("t={timestamp},v1={}", hex::encode(signature)))
}
