//! Engine error types.

use crate::config::Environment;
use thiserror::Error;

/// ACME problem type reported by Let's Encrypt when a nonce was stale.
pub const PROBLEM_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// ACME problem type reported when the account hit a rate limit.
pub const PROBLEM_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";

/// ACME problem type for server-side failures.
pub const PROBLEM_SERVER_INTERNAL: &str = "urn:ietf:params:acme:error:serverInternal";

/// Errors surfaced by the certificate lifecycle engine.
///
/// Every failure carries enough context for the reconciliation harness to
/// decide between requeueing the request and alerting an operator. The
/// engine never downgrades an error into a silent retry.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No ACME account material exists for the requested environment.
    ///
    /// This is a hard precondition failure: nothing can be ordered until an
    /// operator provisions the account secret.
    #[error("no ACME account configured for the {environment} environment")]
    AccountNotConfigured {
        /// Environment whose account secret was missing or incomplete.
        environment: Environment,
    },

    /// The certificate bytes held in the store could not be decoded.
    #[error("stored certificate is malformed: {detail}")]
    MalformedCertificate {
        /// Decode failure description.
        detail: String,
    },

    /// The authorization for a domain does not offer a DNS-01 challenge.
    #[error("no dns-01 challenge available for '{domain}' (offered: {})", available.join(", "))]
    ChallengeTypeUnavailable {
        /// Domain whose authorization lacked DNS-01.
        domain: String,
        /// Challenge types the server did offer.
        available: Vec<String>,
    },

    /// The ACME server marked the submitted challenge invalid.
    #[error("dns-01 challenge for '{domain}' failed validation: {detail}")]
    ChallengeValidationFailed {
        /// Domain whose challenge was rejected.
        domain: String,
        /// Server-reported failure detail.
        detail: String,
    },

    /// Transport or server failure talking to the ACME service.
    #[error("ACME request failed: {detail}")]
    AcmeProtocol {
        /// ACME problem type URN, when the server provided one.
        problem_type: Option<String>,
        /// Human-readable failure detail.
        detail: String,
        /// HTTP status code, when a response was received.
        status: Option<u16>,
    },

    /// The certificate request itself is unusable (empty or invalid domain
    /// set).
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    /// An operation was invoked in a session state that does not allow it.
    #[error("cannot {operation} while the session is in state {state}")]
    InvalidTransition {
        /// State the session was in.
        state: String,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// Secret store read or write failed.
    #[error("certificate store error: {0}")]
    Store(String),

    /// DNS provisioning collaborator failed.
    #[error("DNS provisioning error: {0}")]
    Dns(String),

    /// Key loading or signing failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// CSR generation failed.
    #[error("CSR generation error: {0}")]
    Csr(String),

    /// A bounded wait elapsed without the expected state change.
    #[error("timed out {0}")]
    Timeout(String),
}

impl EngineError {
    /// Whether the harness may reasonably requeue the request and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AcmeProtocol {
                problem_type,
                status,
                ..
            } => {
                if let Some(kind) = problem_type {
                    return matches!(
                        kind.as_str(),
                        PROBLEM_BAD_NONCE | PROBLEM_RATE_LIMITED | PROBLEM_SERVER_INTERNAL
                    );
                }
                status.map_or(true, |code| code >= 500)
            },
            Self::Store(_) | Self::Dns(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the failure requires operator intervention before a retry
    /// could possibly succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AccountNotConfigured { .. }
                | Self::MalformedCertificate { .. }
                | Self::ChallengeTypeUnavailable { .. }
                | Self::InvalidRequest(_)
                | Self::InvalidTransition { .. }
        )
    }

    /// The ACME problem type URN, if this error carries one.
    pub fn problem_type(&self) -> Option<&str> {
        match self {
            Self::AcmeProtocol { problem_type, .. } => problem_type.as_deref(),
            _ => None,
        }
    }
}

impl From<openssl::error::ErrorStack> for EngineError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::Crypto(err.to_string())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
