//! Configuration parsing.
//!
//! The daemon reads a TOML file into [`SubsyncConfig`]. Every section is
//! optional and falls back to the defaults documented on each field. The
//! webhook signing secret never appears in the file; the file names the
//! environment variable that holds it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::SubscriptionPolicy;

/// Upper bound for `webhook.tolerance_secs` (one day).
const MAX_TOLERANCE_SECS: u64 = 86_400;
/// Upper bound for subscription and trial periods (ten years).
const MAX_PERIOD_DAYS: u32 = 3_650;
/// Upper bound for `session.ttl_secs` (one year).
const MAX_SESSION_TTL_SECS: u64 = 365 * 86_400;

fn secs(value: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubsyncConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Inbound payment webhooks.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Subscription periods.
    #[serde(default)]
    pub subscription: SubscriptionConfig,

    /// Bearer sessions.
    #[serde(default)]
    pub session: SessionConfig,
}

impl SubsyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, contains unknown keys, or
    /// fails [`SubsyncConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks values that parse but make no sense.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook.secret_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "webhook.secret_env must name an environment variable".to_string(),
            ));
        }
        if !(1..=MAX_TOLERANCE_SECS).contains(&self.webhook.tolerance_secs) {
            return Err(ConfigError::Validation(format!(
                "webhook.tolerance_secs must be between 1 and {MAX_TOLERANCE_SECS}"
            )));
        }
        if !(1..=MAX_PERIOD_DAYS).contains(&self.subscription.period_days) {
            return Err(ConfigError::Validation(format!(
                "subscription.period_days must be between 1 and {MAX_PERIOD_DAYS}"
            )));
        }
        if self.subscription.signup_trial_days > MAX_PERIOD_DAYS {
            return Err(ConfigError::Validation(format!(
                "subscription.signup_trial_days must be at most {MAX_PERIOD_DAYS}"
            )));
        }
        if !(1..=MAX_SESSION_TTL_SECS).contains(&self.session.ttl_secs) {
            return Err(ConfigError::Validation(format!(
                "session.ttl_secs must be between 1 and {MAX_SESSION_TTL_SECS}"
            )));
        }
        if self.session.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "session.max_sessions must be positive".to_string(),
            ));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "database.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads the webhook signing secret from the configured environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] if the variable is unset or
    /// blank.
    pub fn webhook_secret(&self) -> Result<SecretString, ConfigError> {
        self.webhook_secret_from(|name| std::env::var(name).ok())
    }

    /// Same as [`SubsyncConfig::webhook_secret`] with an injectable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] if the lookup yields nothing
    /// usable.
    pub fn webhook_secret_from(
        &self,
        lookup: impl FnOnce(&str) -> Option<String>,
    ) -> Result<SecretString, ConfigError> {
        let name = self.webhook.secret_env.as_str();
        match lookup(name) {
            Some(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
            _ => Err(ConfigError::MissingSecret(name.to_string())),
        }
    }

    /// Subscription policy derived from the `[subscription]` section.
    #[must_use]
    pub fn subscription_policy(&self) -> SubscriptionPolicy {
        SubscriptionPolicy {
            period: TimeDelta::days(i64::from(self.subscription.period_days)),
            signup_trial: (self.subscription.signup_trial_days > 0)
                .then(|| TimeDelta::days(i64::from(self.subscription.signup_trial_days))),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind (default `127.0.0.1:8080`).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// `SQLite` database file (default `subsync.db`).
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Webhook configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Environment variable holding the signing secret
    /// (default `STRIPE_WEBHOOK_SECRET`).
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// Maximum distance between the signed timestamp and now, in seconds
    /// (default 300).
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
}

impl WebhookConfig {
    /// Accepted signature timestamp skew.
    #[must_use]
    pub fn tolerance(&self) -> TimeDelta {
        secs(self.tolerance_secs)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            tolerance_secs: default_tolerance_secs(),
        }
    }
}

/// Subscription period configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionConfig {
    /// Length of one paid period in days (default 30).
    #[serde(default = "default_period_days")]
    pub period_days: u32,

    /// Active trial granted at registration, in days. Zero (the default)
    /// registers accounts as inactive.
    #[serde(default)]
    pub signup_trial_days: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            period_days: default_period_days(),
            signup_trial_days: 0,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Session lifetime in seconds (default 86400).
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,

    /// Upper bound on live sessions (default 10000).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl SessionConfig {
    /// Session lifetime.
    #[must_use]
    pub fn ttl(&self) -> TimeDelta {
        secs(self.ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_database_path() -> PathBuf {
    PathBuf::from("subsync.db")
}

fn default_secret_env() -> String {
    "STRIPE_WEBHOOK_SECRET".to_string()
}

const fn default_tolerance_secs() -> u64 {
    300
}

const fn default_period_days() -> u32 {
    30
}

const fn default_session_ttl_secs() -> u64 {
    86_400
}

const fn default_max_sessions() -> usize {
    10_000
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// The webhook secret variable is unset or blank.
    #[error("environment variable {0} is not set")]
    MissingSecret(String),
}
