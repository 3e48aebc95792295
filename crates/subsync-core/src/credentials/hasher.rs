//! One-way credential hashing.

use std::fmt;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Errors from producing a credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The hashing backend rejected its parameters or input.
    #[error("credential hashing failed: {0}")]
    Hashing(String),
}

/// Opaque, self-describing password credential.
///
/// The stored string carries its own algorithm, parameters, and salt.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordCredential(String);

impl PasswordCredential {
    /// Wraps a credential read back from storage.
    #[must_use]
    pub fn from_stored(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// The encoded form written to storage.
    #[must_use]
    pub fn as_stored(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PasswordCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordCredential([REDACTED])")
    }
}

/// Produces and checks password credentials.
pub trait CredentialHasher: Send + Sync {
    /// Hashes `password` with a fresh salt.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Hashing`] if the backend fails.
    fn hash(&self, password: &SecretString) -> Result<PasswordCredential, CredentialError>;

    /// Returns `true` if `password` matches `credential`.
    ///
    /// A credential that cannot be parsed never matches.
    fn verify(&self, password: &SecretString, credential: &PasswordCredential) -> bool;
}

/// Argon2id hasher producing PHC strings.
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    /// Hasher with the library's recommended parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            params: Params::default(),
        }
    }

    /// Hasher with explicit cost parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Hashing`] if the parameters are out of
    /// range.
    pub fn with_costs(
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    ) -> Result<Self, CredentialError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| CredentialError::Hashing(e.to_string()))?;
        Ok(Self { params })
    }

    /// Minimum-cost hasher for tests.
    ///
    /// # Errors
    ///
    /// Same as [`Argon2Hasher::with_costs`].
    pub fn insecure_fast() -> Result<Self, CredentialError> {
        Self::with_costs(Params::MIN_M_COST, Params::MIN_T_COST, Params::MIN_P_COST)
    }

    fn engine(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, password: &SecretString) -> Result<PasswordCredential, CredentialError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .engine()
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .map_err(|e| CredentialError::Hashing(e.to_string()))?;
        Ok(PasswordCredential(hash.to_string()))
    }

    fn verify(&self, password: &SecretString, credential: &PasswordCredential) -> bool {
        let Ok(parsed) = PasswordHash::new(credential.as_stored()) else {
            return false;
        };
        self.engine()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn hash_then_verify() {
        let hasher = Argon2Hasher::insecure_fast().unwrap();
        let credential = hasher.hash(&secret("correct horse")).unwrap();

        assert!(hasher.verify(&secret("correct horse"), &credential));
        assert!(!hasher.verify(&secret("wrong horse"), &credential));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = Argon2Hasher::insecure_fast().unwrap();
        let a = hasher.hash(&secret("same")).unwrap();
        let b = hasher.hash(&secret("same")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unparseable_credential_never_matches() {
        let hasher = Argon2Hasher::insecure_fast().unwrap();
        let bogus = PasswordCredential::from_stored("24326224313224");
        assert!(!hasher.verify(&secret("anything"), &bogus));
    }

    #[test]
    fn debug_output_is_redacted() {
        let hasher = Argon2Hasher::insecure_fast().unwrap();
        let credential = hasher.hash(&secret("pw")).unwrap();
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("argon2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn out_of_range_costs_are_rejected() {
        assert!(Argon2Hasher::with_costs(0, 0, 0).is_err());
    }
}
