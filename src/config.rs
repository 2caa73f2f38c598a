//! Engine configuration types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Days before expiry at which renewal triggers when a request does not set
/// its own threshold.
pub const DEFAULT_RENEW_BEFORE_DAYS: u32 = 30;

/// ACME environment a request is issued against.
///
/// Staging and production carry independent account identities and secret
/// names, so the environment is threaded through account loading instead of
/// branching on secret names at each call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Let's Encrypt staging (untrusted chain, relaxed rate limits).
    Staging,
    /// Let's Encrypt production.
    Production,
}

impl Environment {
    /// ACME directory URL for this environment.
    pub fn directory_url(&self) -> &'static str {
        match self {
            Self::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
            Self::Production => "https://acme-v02.api.letsencrypt.org/directory",
        }
    }

    /// Name of the secret holding this environment's account material.
    pub fn account_secret_name(&self) -> &'static str {
        match self {
            Self::Staging => "lets-encrypt-account-staging",
            Self::Production => "lets-encrypt-account-production",
        }
    }

    /// Lowercase identifier used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the certificate lifecycle engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Namespace the per-environment ACME account secrets live in.
    #[serde(default = "default_operator_namespace")]
    pub operator_namespace: String,

    /// Renewal threshold applied when a request leaves its own unset.
    #[serde(default = "default_renew_before_days")]
    pub default_renew_before_days: u32,

    /// Seconds between challenge status polls within one issuance attempt.
    #[serde(default = "default_challenge_poll_interval_secs")]
    pub challenge_poll_interval_secs: u64,

    /// Challenge polls before the attempt is abandoned as timed out.
    #[serde(default = "default_poll_attempts")]
    pub challenge_poll_attempts: u32,

    /// Seconds between order status polls after finalization.
    #[serde(default = "default_order_poll_interval_secs")]
    pub order_poll_interval_secs: u64,

    /// Order polls before the attempt is abandoned as timed out.
    #[serde(default = "default_poll_attempts")]
    pub order_poll_attempts: u32,

    /// Log a warning when a freshly issued certificate was not signed by
    /// Let's Encrypt. Never a hard failure.
    #[serde(default)]
    pub verify_issuer: bool,
}

fn default_operator_namespace() -> String {
    "certminder".to_string()
}

fn default_renew_before_days() -> u32 {
    DEFAULT_RENEW_BEFORE_DAYS
}

fn default_challenge_poll_interval_secs() -> u64 {
    5
}

fn default_order_poll_interval_secs() -> u64 {
    2
}

fn default_poll_attempts() -> u32 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operator_namespace: default_operator_namespace(),
            default_renew_before_days: DEFAULT_RENEW_BEFORE_DAYS,
            challenge_poll_interval_secs: default_challenge_poll_interval_secs(),
            challenge_poll_attempts: default_poll_attempts(),
            order_poll_interval_secs: default_order_poll_interval_secs(),
            order_poll_attempts: default_poll_attempts(),
            verify_issuer: false,
        }
    }
}

impl EngineConfig {
    /// Challenge poll interval as a [`Duration`].
    pub fn challenge_poll_interval(&self) -> Duration {
        Duration::from_secs(self.challenge_poll_interval_secs)
    }

    /// Order poll interval as a [`Duration`].
    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_secs(self.order_poll_interval_secs)
    }
}
