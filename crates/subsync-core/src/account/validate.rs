//! Registration field checks.

use secrecy::{ExposeSecret, SecretString};

use super::AccountError;

/// Longest accepted email, in bytes.
pub const MAX_EMAIL_LEN: usize = 255;
/// Longest accepted username, in bytes.
pub const MAX_USERNAME_LEN: usize = 50;
/// Longest accepted display name, in bytes.
pub const MAX_NAME_LEN: usize = 100;
/// Shortest accepted password, in bytes.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Checks that `email` is plausibly an address.
///
/// Only shape is checked: non-empty, at most [`MAX_EMAIL_LEN`] bytes, and an
/// `@` with something on both sides. Emails are compared exactly elsewhere,
/// so nothing is normalized here.
///
/// # Errors
///
/// Returns [`AccountError::InvalidInput`] describing the first problem.
pub fn validate_email(email: &str) -> Result<(), AccountError> {
    if email.is_empty() {
        return Err(invalid("email must not be empty"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(invalid(format!(
            "email must be at most {MAX_EMAIL_LEN} bytes"
        )));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(invalid("email must contain a local part and a domain")),
    }
}

pub(super) fn registration(
    email: &str,
    username: &str,
    password: &SecretString,
    name: &str,
) -> Result<(), AccountError> {
    validate_email(email)?;
    bounded("username", username, MAX_USERNAME_LEN)?;
    bounded("name", name, MAX_NAME_LEN)?;
    if password.expose_secret().len() < MIN_PASSWORD_LEN {
        return Err(invalid(format!(
            "password must be at least {MIN_PASSWORD_LEN} bytes"
        )));
    }
    Ok(())
}

fn bounded(field: &str, value: &str, max: usize) -> Result<(), AccountError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(invalid(format!("{field} must be at most {max} bytes")));
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> AccountError {
    AccountError::InvalidInput(reason.into())
}
