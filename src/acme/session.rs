//! ACME issuance session.
//!
//! One session drives one issuance attempt: account load, order creation,
//! the per-domain DNS-01 challenge dance, finalization, and download. The
//! session is an explicit state machine. Every operation names the states
//! it is legal in and rejects everything else, so ordering bugs surface as
//! [`EngineError::InvalidTransition`] instead of opaque server rejections.
//!
//! The session performs single protocol steps only. Poll cadence, DNS
//! propagation waits, and retry policy belong to the caller.

use crate::acme::account::AccountCredentials;
use crate::acme::dns01_txt_digest;
use crate::acme::resources::{
    AuthorizationResource, AuthorizationStatus, ChallengeStatus, Identifier, OrderResource,
    OrderStatus, DNS01,
};
use crate::acme::transport::AcmeTransport;
use crate::config::Environment;
use crate::error::{EngineError, EngineResult};
use crate::store::CertificateStore;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Session states, in issuance order.
///
/// `Failed` is terminal and reachable from any non-terminal state; the
/// reason records what went wrong. Between `AuthorizationsPending` and
/// `ChallengeValidated` the machine loops once per domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No account loaded yet.
    Uninitialized,
    /// Account credentials loaded; orders may be created.
    AccountLoaded,
    /// Order created, authorizations not yet touched.
    OrderCreated,
    /// An authorization is being worked on.
    AuthorizationsPending,
    /// The current challenge was submitted for validation.
    ChallengeSubmitted,
    /// The current challenge validated; more authorizations may follow.
    ChallengeValidated,
    /// CSR submitted, waiting for the certificate endpoint.
    Finalizing,
    /// Certificate chain downloaded.
    CertificateIssued,
    /// Terminal failure.
    Failed(String),
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::AccountLoaded => "AccountLoaded",
            Self::OrderCreated => "OrderCreated",
            Self::AuthorizationsPending => "AuthorizationsPending",
            Self::ChallengeSubmitted => "ChallengeSubmitted",
            Self::ChallengeValidated => "ChallengeValidated",
            Self::Finalizing => "Finalizing",
            Self::CertificateIssued => "CertificateIssued",
            Self::Failed(_) => "Failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "Failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// A computed DNS-01 key authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAuthorization {
    /// `token.thumbprint`, the raw key authorization.
    pub value: String,
    /// Base64url SHA-256 digest published as the TXT record value.
    pub txt_digest: String,
}

/// The order a session is working on.
#[derive(Debug)]
struct ActiveOrder {
    url: String,
    resource: OrderResource,
    validated: usize,
}

/// The authorization currently being worked on.
#[derive(Debug)]
struct ActiveAuthorization {
    domain: String,
    challenge_types: Vec<String>,
    challenge: Option<SelectedChallenge>,
}

#[derive(Debug)]
struct SelectedChallenge {
    url: String,
    token: String,
    key_authorization: Option<KeyAuthorization>,
}

/// One ACME issuance attempt.
pub struct AcmeSession {
    transport: Arc<dyn AcmeTransport>,
    state: SessionState,
    account: Option<AccountCredentials>,
    order: Option<ActiveOrder>,
    authorization: Option<ActiveAuthorization>,
}

impl AcmeSession {
    /// Create a fresh session over a transport.
    pub fn new(transport: Arc<dyn AcmeTransport>) -> Self {
        Self {
            transport,
            state: SessionState::Uninitialized,
            account: None,
            order: None,
            authorization: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// URL of the active order, once one exists.
    pub fn order_url(&self) -> Option<&str> {
        self.order.as_ref().map(|o| o.url.as_str())
    }

    /// Authorization URLs of the active order.
    pub fn authorization_urls(&self) -> Vec<String> {
        self.order
            .as_ref()
            .map(|o| o.resource.authorizations.clone())
            .unwrap_or_default()
    }

    /// Domain of the authorization currently being worked on.
    pub fn authorization_domain(&self) -> Option<&str> {
        self.authorization.as_ref().map(|a| a.domain.as_str())
    }

    /// URL of the currently selected challenge.
    pub fn challenge_url(&self) -> Option<&str> {
        self.authorization
            .as_ref()
            .and_then(|a| a.challenge.as_ref())
            .map(|c| c.url.as_str())
    }

    /// How many of the order's authorizations have validated.
    pub fn validated_authorizations(&self) -> usize {
        self.order.as_ref().map(|o| o.validated).unwrap_or(0)
    }

    /// Load the account for `environment` from the store.
    ///
    /// The single precondition gating every other operation. A missing or
    /// incomplete account secret is a request-level failure, not a
    /// retryable state.
    pub fn load_account(
        &mut self,
        store: &dyn CertificateStore,
        environment: Environment,
        namespace: &str,
    ) -> EngineResult<()> {
        if self.state != SessionState::Uninitialized {
            return Err(self.invalid_transition("load_account"));
        }

        let credentials = AccountCredentials::load(store, environment, namespace)?;
        self.account = Some(credentials);
        self.state = SessionState::AccountLoaded;
        Ok(())
    }

    /// Register a contact email on the loaded account.
    pub async fn update_account_contact(&mut self, email: &str) -> EngineResult<()> {
        let account = self.require_account("update_account_contact")?;
        let contacts = vec![format!("mailto:{}", email)];
        self.transport.update_account(account, &contacts).await?;
        Ok(())
    }

    /// Create an order for the domain set and return its authorization
    /// URLs, one per domain.
    pub async fn create_order(&mut self, domains: &[String]) -> EngineResult<Vec<String>> {
        if self.state != SessionState::AccountLoaded {
            return Err(self.invalid_transition("create_order"));
        }
        validate_domains(domains)?;

        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::dns(d.clone())).collect();
        let account = self.require_account("create_order")?;
        let (url, resource) = self.transport.create_order(account, &identifiers).await?;

        info!(
            order = %url,
            domains = %domains.join(","),
            authorizations = resource.authorizations.len(),
            "created ACME order"
        );

        let authorizations = resource.authorizations.clone();
        self.order = Some(ActiveOrder {
            url,
            resource,
            validated: 0,
        });
        self.state = SessionState::OrderCreated;
        Ok(authorizations)
    }

    /// Fetch one authorization and make it the session's active one.
    ///
    /// An authorization the server already considers valid counts as
    /// validated immediately and moves the session to `ChallengeValidated`
    /// without a challenge round.
    pub async fn fetch_authorization(
        &mut self,
        authorization_url: &str,
    ) -> EngineResult<AuthorizationResource> {
        if !matches!(
            self.state,
            SessionState::OrderCreated
                | SessionState::AuthorizationsPending
                | SessionState::ChallengeValidated
        ) {
            return Err(self.invalid_transition("fetch_authorization"));
        }

        let account = self.require_account("fetch_authorization")?;
        let resource = self
            .transport
            .fetch_authorization(account, authorization_url)
            .await?;

        match resource.status {
            AuthorizationStatus::Pending => {
                self.authorization = Some(ActiveAuthorization {
                    domain: resource.domain().to_string(),
                    challenge_types: resource.available_challenge_types(),
                    challenge: None,
                });
                self.state = SessionState::AuthorizationsPending;
            },
            AuthorizationStatus::Valid => {
                debug!(domain = resource.domain(), "authorization already valid");
                self.authorization = None;
                if let Some(order) = self.order.as_mut() {
                    order.validated += 1;
                }
                self.state = SessionState::ChallengeValidated;
            },
            status => {
                let reason = format!(
                    "authorization for {} is {:?}",
                    resource.domain(),
                    status
                );
                self.state = SessionState::Failed(reason.clone());
                return Err(EngineError::AcmeProtocol {
                    problem_type: None,
                    detail: reason,
                    status: None,
                });
            },
        }

        Ok(resource)
    }

    /// Select the DNS-01 challenge of the active authorization.
    ///
    /// DNS-01 is the only supported type; requests routinely target
    /// wildcard and internal names that are unreachable over HTTP. A
    /// missing DNS-01 offer fails without touching session state.
    pub fn select_challenge(&mut self, resource: &AuthorizationResource) -> EngineResult<()> {
        if self.state != SessionState::AuthorizationsPending {
            return Err(self.invalid_transition("select_challenge"));
        }
        let authorization = self
            .authorization
            .as_mut()
            .ok_or_else(|| EngineError::InvalidTransition {
                state: "AuthorizationsPending".to_string(),
                operation: "select_challenge",
            })?;

        let challenge = match resource.dns01_challenge() {
            Some(challenge) => challenge,
            None => {
                return Err(EngineError::ChallengeTypeUnavailable {
                    domain: authorization.domain.clone(),
                    available: authorization.challenge_types.clone(),
                })
            },
        };

        authorization.challenge = Some(SelectedChallenge {
            url: challenge.url.clone(),
            token: challenge.token.clone(),
            key_authorization: None,
        });
        Ok(())
    }

    /// Compute the key authorization for the selected challenge.
    ///
    /// The returned TXT digest must be published at the domain's
    /// `_acme-challenge` record before the challenge is submitted; the
    /// session never creates DNS records itself.
    pub fn key_authorization(&mut self) -> EngineResult<KeyAuthorization> {
        if self.state != SessionState::AuthorizationsPending {
            return Err(self.invalid_transition("compute_key_authorization"));
        }
        let account = self
            .account
            .as_ref()
            .ok_or_else(|| EngineError::InvalidTransition {
                state: SessionState::Uninitialized.to_string(),
                operation: "compute_key_authorization",
            })?;
        let challenge = self
            .authorization
            .as_mut()
            .and_then(|a| a.challenge.as_mut())
            .ok_or_else(|| EngineError::InvalidTransition {
                state: "AuthorizationsPending".to_string(),
                operation: "compute_key_authorization",
            })?;

        let value = account.key.key_authorization(&challenge.token)?;
        let key_authorization = KeyAuthorization {
            txt_digest: dns01_txt_digest(&value),
            value,
        };
        challenge.key_authorization = Some(key_authorization.clone());
        Ok(key_authorization)
    }

    /// Tell the server the selected challenge is ready for validation.
    ///
    /// Requires the key authorization to have been computed first; the
    /// TXT record cannot exist otherwise, so submitting earlier is an
    /// ordering bug.
    pub async fn submit_challenge(&mut self) -> EngineResult<()> {
        if self.state != SessionState::AuthorizationsPending {
            return Err(self.invalid_transition("submit_challenge"));
        }
        let challenge = self
            .authorization
            .as_ref()
            .and_then(|a| a.challenge.as_ref());
        let ready = challenge
            .map(|c| c.key_authorization.is_some())
            .unwrap_or(false);
        if !ready {
            return Err(self.invalid_transition("submit_challenge"));
        }

        let url = challenge.map(|c| c.url.clone()).unwrap_or_default();
        let account = self.require_account("submit_challenge")?;
        self.transport.submit_challenge(account, &url).await?;
        self.state = SessionState::ChallengeSubmitted;
        Ok(())
    }

    /// Single challenge status check.
    ///
    /// `valid` advances to `ChallengeValidated`; `invalid` is terminal and
    /// reported as [`EngineError::ChallengeValidationFailed`]; anything
    /// else leaves the state unchanged for the caller to poll again.
    pub async fn poll_challenge(&mut self) -> EngineResult<ChallengeStatus> {
        if self.state != SessionState::ChallengeSubmitted {
            return Err(self.invalid_transition("poll_challenge"));
        }

        let (url, domain) = match self.authorization.as_ref() {
            Some(authorization) => (
                authorization
                    .challenge
                    .as_ref()
                    .map(|c| c.url.clone())
                    .unwrap_or_default(),
                authorization.domain.clone(),
            ),
            None => return Err(self.invalid_transition("poll_challenge")),
        };

        let account = self.require_account("poll_challenge")?;
        let challenge = self.transport.fetch_challenge(account, &url).await?;

        match challenge.status {
            ChallengeStatus::Valid => {
                info!(domain = %domain, "dns-01 challenge validated");
                self.authorization = None;
                if let Some(order) = self.order.as_mut() {
                    order.validated += 1;
                }
                self.state = SessionState::ChallengeValidated;
                Ok(ChallengeStatus::Valid)
            },
            ChallengeStatus::Invalid => {
                let detail = challenge
                    .error
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "challenge marked invalid".to_string());
                self.state = SessionState::Failed(detail.clone());
                Err(EngineError::ChallengeValidationFailed { domain, detail })
            },
            status => Ok(status),
        }
    }

    /// Submit the CSR. Legal only after every authorization validated.
    pub async fn finalize_order(&mut self, csr_der: &[u8]) -> EngineResult<()> {
        let all_validated = self
            .order
            .as_ref()
            .map(|o| o.validated >= o.resource.authorizations.len())
            .unwrap_or(false);
        if self.state != SessionState::ChallengeValidated || !all_validated {
            return Err(self.invalid_transition("finalize_order"));
        }

        let finalize_url = self
            .order
            .as_ref()
            .map(|o| o.resource.finalize.clone())
            .unwrap_or_default();
        let account = self.require_account("finalize_order")?;
        let resource = self
            .transport
            .finalize_order(account, &finalize_url, csr_der)
            .await?;

        if resource.status == OrderStatus::Invalid {
            let reason = resource
                .error
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "order invalid after finalization".to_string());
            self.state = SessionState::Failed(reason.clone());
            return Err(EngineError::AcmeProtocol {
                problem_type: resource.error.and_then(|p| p.problem_type),
                detail: reason,
                status: None,
            });
        }

        if let Some(order) = self.order.as_mut() {
            order.resource = resource;
        }
        self.state = SessionState::Finalizing;
        Ok(())
    }

    /// Single order status check while finalizing.
    pub async fn refresh_order(&mut self) -> EngineResult<OrderStatus> {
        if self.state != SessionState::Finalizing {
            return Err(self.invalid_transition("refresh_order"));
        }

        let url = self.order.as_ref().map(|o| o.url.clone()).unwrap_or_default();
        let account = self.require_account("refresh_order")?;
        let resource = self.transport.fetch_order(account, &url).await?;

        if resource.status == OrderStatus::Invalid {
            let reason = resource
                .error
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "order went invalid".to_string());
            self.state = SessionState::Failed(reason.clone());
            return Err(EngineError::AcmeProtocol {
                problem_type: resource.error.and_then(|p| p.problem_type),
                detail: reason,
                status: None,
            });
        }

        let status = resource.status;
        if let Some(order) = self.order.as_mut() {
            order.resource = resource;
        }
        Ok(status)
    }

    /// Download the certificate chain once the order's certificate
    /// endpoint is populated.
    pub async fn download_certificate(&mut self) -> EngineResult<String> {
        if self.state != SessionState::Finalizing {
            return Err(self.invalid_transition("download_certificate"));
        }
        let certificate_url = match self
            .order
            .as_ref()
            .and_then(|o| o.resource.certificate.clone())
        {
            Some(url) => url,
            None => return Err(self.invalid_transition("download_certificate")),
        };

        let account = self.require_account("download_certificate")?;
        let chain = self
            .transport
            .download_certificate(account, &certificate_url)
            .await?;
        self.state = SessionState::CertificateIssued;
        Ok(chain)
    }

    /// Revoke a certificate. Independent of the issuance sequence; legal
    /// whenever an account is loaded.
    pub async fn revoke_certificate(&self, certificate_der: &[u8]) -> EngineResult<()> {
        let account = self.require_account("revoke_certificate")?;
        self.transport
            .revoke_certificate(account, certificate_der)
            .await
    }

    fn require_account(&self, operation: &'static str) -> EngineResult<&AccountCredentials> {
        self.account
            .as_ref()
            .ok_or_else(|| EngineError::InvalidTransition {
                state: SessionState::Uninitialized.to_string(),
                operation,
            })
    }

    fn invalid_transition(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            state: self.state.to_string(),
            operation,
        }
    }
}

fn validate_domains(domains: &[String]) -> EngineResult<()> {
    if domains.is_empty() {
        return Err(EngineError::InvalidRequest(
            "order requires at least one domain".to_string(),
        ));
    }
    for domain in domains {
        validate_domain(domain)?;
    }
    Ok(())
}

fn validate_domain(domain: &str) -> EngineResult<()> {
    if domain.is_empty() {
        return Err(EngineError::InvalidRequest("empty domain".to_string()));
    }
    if domain.len() > 253 {
        return Err(EngineError::InvalidRequest(format!(
            "domain too long: {}",
            domain
        )));
    }
    for c in domain.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '*' {
            return Err(EngineError::InvalidRequest(format!(
                "invalid character '{}' in domain {}",
                c, domain
            )));
        }
    }
    if domain.contains('*') {
        if !domain.starts_with("*.") {
            return Err(EngineError::InvalidRequest(format!(
                "wildcard must be the leftmost label: {}",
                domain
            )));
        }
        if domain.matches('*').count() > 1 {
            return Err(EngineError::InvalidRequest(format!(
                "only one wildcard allowed: {}",
                domain
            )));
        }
    }
    Ok(())
}
