//! Certificate lifecycle engine.
//!
//! One `reconcile` call drives one certificate request to a terminal
//! outcome: a fresh certificate persisted to the store, a no-op because the
//! stored certificate is still inside its validity window, or an error for
//! the reconciliation harness to act on. The engine never retries across
//! attempts (requeue policy belongs to the harness) and it only touches
//! the stored certificate on full success.

use crate::acme::resources::{ChallengeStatus, OrderStatus};
use crate::acme::session::{AcmeSession, SessionState};
use crate::acme::transport::AcmeTransport;
use crate::cert::ParsedCertificate;
use crate::config::{EngineConfig, Environment};
use crate::dns::DnsProvisioner;
use crate::error::{EngineError, EngineResult};
use crate::renewal;
use crate::store::{CertificateStore, Secret, TLS_CERTIFICATE_KEY, TLS_PRIVATE_KEY_KEY};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A declarative certificate request, created externally and read-only to
/// the engine.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    /// Request name, used for logging only.
    pub name: String,
    /// Namespace the certificate secret lives in.
    pub namespace: String,
    /// Domains the certificate must cover.
    pub domains: Vec<String>,
    /// Name of the secret holding the certificate material.
    pub secret_name: String,
    /// Days before expiry at which to renew. Zero or below means unset and
    /// the engine default applies.
    pub renew_before_days: i64,
    /// ACME environment to issue against.
    pub environment: Environment,
}

/// A certificate issued by a completed reconciliation.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Parsed leaf certificate.
    pub certificate: ParsedCertificate,
    /// Full PEM chain as downloaded.
    pub chain_pem: String,
}

/// Terminal outcome of one reconciliation pass.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The stored certificate is still good; nothing was done.
    UpToDate,
    /// A certificate was issued and persisted.
    Issued(IssuedCertificate),
}

/// Orchestrates renewal policy and the ACME session per request.
pub struct LifecycleEngine {
    store: Arc<dyn CertificateStore>,
    transport: Arc<dyn AcmeTransport>,
    dns: Arc<dyn DnsProvisioner>,
    config: EngineConfig,
}

impl LifecycleEngine {
    /// Create an engine over its three collaborators.
    pub fn new(
        store: Arc<dyn CertificateStore>,
        transport: Arc<dyn AcmeTransport>,
        dns: Arc<dyn DnsProvisioner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            dns,
            config,
        }
    }

    /// Drive one certificate request to a terminal outcome.
    pub async fn reconcile(&self, request: &CertificateRequest) -> EngineResult<ReconcileOutcome> {
        let existing = self.store.get(&request.secret_name, &request.namespace)?;
        let existing_cert = existing.as_ref().and_then(|s| s.get(TLS_CERTIFICATE_KEY));

        if !renewal::should_renew(
            existing_cert,
            request.renew_before_days,
            self.config.default_renew_before_days,
        )? {
            info!(request = %request.name, secret = %request.secret_name, "certificate up to date");
            return Ok(ReconcileOutcome::UpToDate);
        }

        info!(
            request = %request.name,
            domains = %request.domains.join(","),
            environment = %request.environment,
            "issuing certificate"
        );

        let mut session = AcmeSession::new(Arc::clone(&self.transport));
        session.load_account(
            self.store.as_ref(),
            request.environment,
            &self.config.operator_namespace,
        )?;
        let authorization_urls = session.create_order(&request.domains).await?;

        let mut published = Vec::new();
        let result = self
            .drive_order(&mut session, request, &authorization_urls, &mut published)
            .await;

        // Validation records are transient; withdraw them whether the
        // attempt succeeded or not.
        for record_id in published {
            if let Err(err) = self.dns.withdraw(&record_id).await {
                warn!(record = %record_id, error = %err, "failed to withdraw challenge record");
            }
        }

        let (chain_pem, private_key_pem) = result?;
        let certificate = ParsedCertificate::parse(chain_pem.as_bytes())?;

        if self.config.verify_issuer && !certificate.issued_by_lets_encrypt() {
            warn!(
                request = %request.name,
                issuer_organizations = ?certificate.issuer_organizations,
                issuer_common_name = ?certificate.issuer_common_name,
                "issued certificate was not signed by Let's Encrypt"
            );
        }

        self.persist(request, existing.is_some(), &chain_pem, &private_key_pem)?;

        info!(
            request = %request.name,
            secret = %request.secret_name,
            not_after = %certificate.not_after,
            "certificate issued and persisted"
        );

        Ok(ReconcileOutcome::Issued(IssuedCertificate {
            certificate,
            chain_pem,
        }))
    }

    /// Revoke a certificate against an environment's account.
    pub async fn revoke(
        &self,
        environment: Environment,
        certificate_der: &[u8],
    ) -> EngineResult<()> {
        let mut session = AcmeSession::new(Arc::clone(&self.transport));
        session.load_account(
            self.store.as_ref(),
            environment,
            &self.config.operator_namespace,
        )?;
        session.revoke_certificate(certificate_der).await
    }

    /// Run the order through validation, finalization, and download.
    /// Returns the PEM chain and the certificate's private key.
    async fn drive_order(
        &self,
        session: &mut AcmeSession,
        request: &CertificateRequest,
        authorization_urls: &[String],
        published: &mut Vec<String>,
    ) -> EngineResult<(String, String)> {
        for url in authorization_urls {
            let authorization = session.fetch_authorization(url).await?;
            if session.state() == &SessionState::ChallengeValidated {
                continue;
            }

            session.select_challenge(&authorization)?;
            let key_authorization = session.key_authorization()?;

            let record_id = self
                .dns
                .publish(authorization.domain(), &key_authorization.txt_digest)
                .await?;
            published.push(record_id);

            session.submit_challenge().await?;
            self.await_challenge(session).await?;
        }

        let key_pair =
            KeyPair::generate().map_err(|err| EngineError::Csr(err.to_string()))?;
        let csr = certificate_signing_request(&request.domains, &key_pair)?;
        session.finalize_order(&csr).await?;

        self.await_order(session).await?;
        let chain_pem = session.download_certificate().await?;

        Ok((chain_pem, key_pair.serialize_pem()))
    }

    /// Poll the submitted challenge until it validates.
    async fn await_challenge(&self, session: &mut AcmeSession) -> EngineResult<()> {
        for attempt in 0..self.config.challenge_poll_attempts {
            let status = session.poll_challenge().await?;
            if status == ChallengeStatus::Valid {
                return Ok(());
            }
            debug!(attempt, status = ?status, "challenge not settled yet");
            sleep(self.config.challenge_poll_interval()).await;
        }
        Err(EngineError::Timeout(format!(
            "waiting for dns-01 validation after {} polls",
            self.config.challenge_poll_attempts
        )))
    }

    /// Poll the finalized order until the certificate endpoint appears.
    async fn await_order(&self, session: &mut AcmeSession) -> EngineResult<()> {
        for attempt in 0..self.config.order_poll_attempts {
            let status = session.refresh_order().await?;
            if status == OrderStatus::Valid {
                return Ok(());
            }
            debug!(attempt, status = ?status, "order not complete yet");
            sleep(self.config.order_poll_interval()).await;
        }
        Err(EngineError::Timeout(format!(
            "waiting for order completion after {} polls",
            self.config.order_poll_attempts
        )))
    }

    fn persist(
        &self,
        request: &CertificateRequest,
        exists: bool,
        chain_pem: &str,
        private_key_pem: &str,
    ) -> EngineResult<()> {
        let secret = Secret::new(&request.secret_name, &request.namespace)
            .with_data(TLS_CERTIFICATE_KEY, chain_pem.as_bytes().to_vec())
            .with_data(TLS_PRIVATE_KEY_KEY, private_key_pem.as_bytes().to_vec());

        if exists {
            self.store.update(secret)
        } else {
            self.store.put(secret)
        }
    }
}

/// DER CSR for a fresh key pair covering the request's domains.
fn certificate_signing_request(domains: &[String], key_pair: &KeyPair) -> EngineResult<Vec<u8>> {
    let mut params = CertificateParams::new(domains.to_vec())
        .map_err(|err| EngineError::Csr(err.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(key_pair)
        .map_err(|err| EngineError::Csr(err.to_string()))?;
    Ok(csr.der().as_ref().to_vec())
}
