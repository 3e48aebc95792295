//! Password credentials.
//!
//! Passwords are turned into an opaque [`PasswordCredential`] by a
//! [`CredentialHasher`] and only ever compared through the same hasher. The
//! rest of the crate never looks inside the blob.

mod hasher;

pub use hasher::{Argon2Hasher, CredentialError, CredentialHasher, PasswordCredential};
