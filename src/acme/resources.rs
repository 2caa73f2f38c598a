//! ACME wire resources.
//!
//! Serde models for the RFC 8555 JSON objects the session exchanges with
//! the ACME server. Field names follow the wire format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Challenge type identifier for DNS-01.
pub const DNS01: &str = "dns-01";

/// ACME order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Order is pending authorization.
    Pending,
    /// Order is ready for finalization.
    Ready,
    /// Order is being processed after finalization.
    Processing,
    /// Order is complete and the certificate is downloadable.
    Valid,
    /// Order failed.
    Invalid,
}

/// Authorization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    /// Authorization is pending a challenge.
    Pending,
    /// Authorization is valid.
    Valid,
    /// Authorization is invalid.
    Invalid,
    /// Authorization was deactivated.
    Deactivated,
    /// Authorization expired.
    Expired,
    /// Authorization was revoked.
    Revoked,
}

/// Challenge status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    /// Challenge has not been submitted yet.
    Pending,
    /// Server is validating the challenge.
    Processing,
    /// Challenge completed successfully.
    Valid,
    /// Challenge failed.
    Invalid,
}

/// ACME identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    /// Identifier type.
    #[serde(rename = "type")]
    pub kind: IdentifierKind,
    /// Identifier value (domain name).
    pub value: String,
}

impl Identifier {
    /// Create a DNS identifier.
    pub fn dns(domain: impl Into<String>) -> Self {
        Self {
            kind: IdentifierKind::Dns,
            value: domain.into(),
        }
    }
}

/// Identifier type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    /// DNS domain name.
    Dns,
    /// IP address.
    Ip,
}

/// ACME problem document (RFC 7807 as profiled by RFC 8555).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Problem {
    /// Problem type URN.
    #[serde(rename = "type")]
    pub problem_type: Option<String>,
    /// Human-readable detail.
    pub detail: Option<String>,
    /// HTTP status code.
    pub status: Option<u16>,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.problem_type, &self.detail) {
            (Some(kind), Some(detail)) => write!(f, "{}: {}", kind, detail),
            (Some(kind), None) => f.write_str(kind),
            (None, Some(detail)) => f.write_str(detail),
            (None, None) => f.write_str("unspecified ACME problem"),
        }
    }
}

/// ACME order object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResource {
    /// Order status.
    pub status: OrderStatus,
    /// Ordered identifiers.
    pub identifiers: Vec<Identifier>,
    /// Authorization URLs, one per identifier.
    pub authorizations: Vec<String>,
    /// Finalize URL.
    pub finalize: String,
    /// Certificate download URL, populated once the order is valid.
    #[serde(default)]
    pub certificate: Option<String>,
    /// Order expiry timestamp (RFC 3339).
    #[serde(default)]
    pub expires: Option<String>,
    /// Error details if the order went invalid.
    #[serde(default)]
    pub error: Option<Problem>,
}

impl OrderResource {
    /// Domains covered by this order's DNS identifiers.
    pub fn domains(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .filter(|id| id.kind == IdentifierKind::Dns)
            .map(|id| id.value.as_str())
            .collect()
    }
}

/// ACME authorization object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResource {
    /// Identifier being authorized.
    pub identifier: Identifier,
    /// Authorization status.
    pub status: AuthorizationStatus,
    /// Available challenges.
    pub challenges: Vec<ChallengeResource>,
    /// Whether this authorizes a wildcard name.
    #[serde(default)]
    pub wildcard: bool,
    /// Authorization expiry timestamp (RFC 3339).
    #[serde(default)]
    pub expires: Option<String>,
}

impl AuthorizationResource {
    /// The domain this authorization covers.
    pub fn domain(&self) -> &str {
        &self.identifier.value
    }

    /// Find a challenge by its type identifier.
    pub fn challenge(&self, kind: &str) -> Option<&ChallengeResource> {
        self.challenges.iter().find(|c| c.kind == kind)
    }

    /// The DNS-01 challenge, if offered.
    pub fn dns01_challenge(&self) -> Option<&ChallengeResource> {
        self.challenge(DNS01)
    }

    /// Challenge types the server offered.
    pub fn available_challenge_types(&self) -> Vec<String> {
        self.challenges.iter().map(|c| c.kind.clone()).collect()
    }
}

/// ACME challenge object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResource {
    /// Challenge type identifier.
    #[serde(rename = "type")]
    pub kind: String,
    /// Challenge URL, used for submission and status polling.
    pub url: String,
    /// Challenge status.
    pub status: ChallengeStatus,
    /// Token issued by the server.
    pub token: String,
    /// Error details if the challenge went invalid.
    #[serde(default)]
    pub error: Option<Problem>,
}
