//! # Certminder
//!
//! A certificate lifecycle engine for cluster ingress domains. Certminder
//! decides when a certificate needs (re)issuance and drives issuance
//! through the ACME protocol with DNS-01 validation, against Let's Encrypt
//! or any compatible CA.
//!
//! ## Architecture
//!
//! The engine is embedded by a reconciliation harness: the harness watches
//! declarative [`engine::CertificateRequest`] objects and calls
//! [`engine::LifecycleEngine::reconcile`] once per pass, receiving a
//! terminal outcome or a classified error it can requeue on. Three
//! collaborators are consumed behind traits:
//!
//! - [`store::CertificateStore`]: the secret-like store holding
//!   certificate material and ACME account data
//! - [`dns::DnsProvisioner`]: creates and deletes `_acme-challenge` TXT
//!   records
//! - [`acme::AcmeTransport`]: the remote ACME service
//!
//! Issuance itself is an explicit state machine ([`acme::AcmeSession`])
//! whose operations reject out-of-order use, so protocol sequencing bugs
//! fail fast instead of surfacing as server rejections.

pub mod acme;
pub mod cert;
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod renewal;
pub mod store;

pub use acme::{AcmeSession, AcmeTransport, HttpAcmeTransport, SessionState};
pub use cert::ParsedCertificate;
pub use config::{EngineConfig, Environment, DEFAULT_RENEW_BEFORE_DAYS};
pub use dns::DnsProvisioner;
pub use engine::{CertificateRequest, IssuedCertificate, LifecycleEngine, ReconcileOutcome};
pub use error::{EngineError, EngineResult};
pub use store::{CertificateStore, Secret};
