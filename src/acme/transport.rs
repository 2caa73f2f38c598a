//! ACME transport layer.
//!
//! [`AcmeTransport`] is the seam between the session state machine and the
//! remote ACME service. The HTTP implementation owns everything the state
//! machine should not care about: directory discovery, replay nonces, JWS
//! envelopes, per-call timeouts, and problem-document decoding.

use crate::acme::account::AccountCredentials;
use crate::acme::b64url;
use crate::acme::jws;
use crate::acme::resources::{
    AuthorizationResource, ChallengeResource, Identifier, OrderResource, Problem,
};
use crate::config::Environment;
use crate::error::{EngineError, EngineResult, PROBLEM_BAD_NONCE};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Remote ACME service operations used by the session.
///
/// Every transport or server failure is reported as
/// [`EngineError::AcmeProtocol`], carrying the ACME problem type when the
/// server provided one.
#[async_trait]
pub trait AcmeTransport: Send + Sync {
    /// Create an order for the identifiers. Returns the order URL and body.
    async fn create_order(
        &self,
        account: &AccountCredentials,
        identifiers: &[Identifier],
    ) -> EngineResult<(String, OrderResource)>;

    /// Fetch an order's current state.
    async fn fetch_order(
        &self,
        account: &AccountCredentials,
        order_url: &str,
    ) -> EngineResult<OrderResource>;

    /// Fetch one authorization.
    async fn fetch_authorization(
        &self,
        account: &AccountCredentials,
        authorization_url: &str,
    ) -> EngineResult<AuthorizationResource>;

    /// Tell the server a challenge is ready for validation.
    async fn submit_challenge(
        &self,
        account: &AccountCredentials,
        challenge_url: &str,
    ) -> EngineResult<ChallengeResource>;

    /// Fetch a challenge's current state.
    async fn fetch_challenge(
        &self,
        account: &AccountCredentials,
        challenge_url: &str,
    ) -> EngineResult<ChallengeResource>;

    /// Submit a CSR to an order's finalize endpoint.
    async fn finalize_order(
        &self,
        account: &AccountCredentials,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> EngineResult<OrderResource>;

    /// Download the issued certificate chain as PEM.
    async fn download_certificate(
        &self,
        account: &AccountCredentials,
        certificate_url: &str,
    ) -> EngineResult<String>;

    /// Replace the account's contact list.
    async fn update_account(
        &self,
        account: &AccountCredentials,
        contacts: &[String],
    ) -> EngineResult<()>;

    /// Revoke a certificate by its DER encoding.
    async fn revoke_certificate(
        &self,
        account: &AccountCredentials,
        certificate_der: &[u8],
    ) -> EngineResult<()>;
}

/// ACME directory endpoints.
#[derive(Debug, Clone, Deserialize)]
struct Directory {
    #[serde(rename = "newNonce")]
    new_nonce: String,
    #[serde(rename = "newOrder")]
    new_order: String,
    #[serde(rename = "revokeCert")]
    revoke_cert: String,
}

/// HTTP implementation of [`AcmeTransport`] over reqwest.
pub struct HttpAcmeTransport {
    http: reqwest::Client,
    directory_url: String,
    directory: OnceCell<Directory>,
    // One pooled replay nonce; refetched from newNonce when empty.
    nonce: Mutex<Option<String>>,
}

impl HttpAcmeTransport {
    /// Create a transport against an explicit directory URL.
    pub fn new(directory_url: impl Into<String>, timeout: Duration) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| EngineError::AcmeProtocol {
                problem_type: None,
                detail: format!("failed to build HTTP client: {}", err),
                status: None,
            })?;

        Ok(Self {
            http,
            directory_url: directory_url.into(),
            directory: OnceCell::new(),
            nonce: Mutex::new(None),
        })
    }

    /// Create a transport for a Let's Encrypt environment.
    pub fn for_environment(environment: Environment, timeout: Duration) -> EngineResult<Self> {
        Self::new(environment.directory_url(), timeout)
    }

    async fn directory(&self) -> EngineResult<&Directory> {
        self.directory
            .get_or_try_init(|| async {
                debug!(url = %self.directory_url, "fetching ACME directory");
                let response = self
                    .http
                    .get(&self.directory_url)
                    .send()
                    .await
                    .map_err(request_error)?;
                response.json::<Directory>().await.map_err(request_error)
            })
            .await
    }

    fn remember_nonce(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(value) = headers.get("replay-nonce").and_then(|v| v.to_str().ok()) {
            if let Ok(mut nonce) = self.nonce.lock() {
                *nonce = Some(value.to_string());
            }
        }
    }

    async fn nonce(&self) -> EngineResult<String> {
        let pooled = self.nonce.lock().ok().and_then(|mut n| n.take());
        if let Some(nonce) = pooled {
            return Ok(nonce);
        }

        let new_nonce_url = self.directory().await?.new_nonce.clone();
        let response = self
            .http
            .head(&new_nonce_url)
            .send()
            .await
            .map_err(request_error)?;
        response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| EngineError::AcmeProtocol {
                problem_type: None,
                detail: "server returned no replay nonce".to_string(),
                status: Some(response.status().as_u16()),
            })
    }

    /// Signed POST with a single retry when the server rejects the nonce.
    async fn signed_post(
        &self,
        account: &AccountCredentials,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> EngineResult<reqwest::Response> {
        let mut retried = false;
        loop {
            let nonce = self.nonce().await?;
            let envelope = jws::sign(&account.key, Some(&account.url), &nonce, url, payload)?;

            let response = self
                .http
                .post(url)
                .header("content-type", "application/jose+json")
                .json(&envelope)
                .send()
                .await
                .map_err(request_error)?;

            self.remember_nonce(response.headers());

            if response.status().is_success() {
                return Ok(response);
            }

            let status = response.status().as_u16();
            let problem = decode_problem(response).await;
            if !retried && problem.problem_type.as_deref() == Some(PROBLEM_BAD_NONCE) {
                warn!(url, "stale ACME nonce, retrying once");
                retried = true;
                continue;
            }
            return Err(problem_error(problem, status));
        }
    }

    async fn signed_post_json<T: serde::de::DeserializeOwned>(
        &self,
        account: &AccountCredentials,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> EngineResult<T> {
        let response = self.signed_post(account, url, payload).await?;
        response.json::<T>().await.map_err(request_error)
    }
}

#[async_trait]
impl AcmeTransport for HttpAcmeTransport {
    async fn create_order(
        &self,
        account: &AccountCredentials,
        identifiers: &[Identifier],
    ) -> EngineResult<(String, OrderResource)> {
        let new_order_url = self.directory().await?.new_order.clone();
        let payload = serde_json::json!({ "identifiers": identifiers });

        let response = self
            .signed_post(account, &new_order_url, Some(&payload))
            .await?;
        let order_url = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| EngineError::AcmeProtocol {
                problem_type: None,
                detail: "new-order response carried no Location header".to_string(),
                status: Some(response.status().as_u16()),
            })?;
        let order = response.json::<OrderResource>().await.map_err(request_error)?;
        Ok((order_url, order))
    }

    async fn fetch_order(
        &self,
        account: &AccountCredentials,
        order_url: &str,
    ) -> EngineResult<OrderResource> {
        self.signed_post_json(account, order_url, None).await
    }

    async fn fetch_authorization(
        &self,
        account: &AccountCredentials,
        authorization_url: &str,
    ) -> EngineResult<AuthorizationResource> {
        self.signed_post_json(account, authorization_url, None).await
    }

    async fn submit_challenge(
        &self,
        account: &AccountCredentials,
        challenge_url: &str,
    ) -> EngineResult<ChallengeResource> {
        // An empty JSON object tells the server the challenge is ready.
        let payload = serde_json::json!({});
        self.signed_post_json(account, challenge_url, Some(&payload))
            .await
    }

    async fn fetch_challenge(
        &self,
        account: &AccountCredentials,
        challenge_url: &str,
    ) -> EngineResult<ChallengeResource> {
        self.signed_post_json(account, challenge_url, None).await
    }

    async fn finalize_order(
        &self,
        account: &AccountCredentials,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> EngineResult<OrderResource> {
        let payload = serde_json::json!({ "csr": b64url(csr_der) });
        self.signed_post_json(account, finalize_url, Some(&payload))
            .await
    }

    async fn download_certificate(
        &self,
        account: &AccountCredentials,
        certificate_url: &str,
    ) -> EngineResult<String> {
        let response = self.signed_post(account, certificate_url, None).await?;
        response.text().await.map_err(request_error)
    }

    async fn update_account(
        &self,
        account: &AccountCredentials,
        contacts: &[String],
    ) -> EngineResult<()> {
        let payload = serde_json::json!({ "contact": contacts });
        self.signed_post(account, &account.url, Some(&payload))
            .await?;
        Ok(())
    }

    async fn revoke_certificate(
        &self,
        account: &AccountCredentials,
        certificate_der: &[u8],
    ) -> EngineResult<()> {
        let revoke_url = self.directory().await?.revoke_cert.clone();
        let payload = serde_json::json!({ "certificate": b64url(certificate_der) });
        self.signed_post(account, &revoke_url, Some(&payload)).await?;
        Ok(())
    }
}

fn request_error(err: reqwest::Error) -> EngineError {
    EngineError::AcmeProtocol {
        problem_type: None,
        detail: err.to_string(),
        status: err.status().map(|s| s.as_u16()),
    }
}

async fn decode_problem(response: reqwest::Response) -> Problem {
    let status = response.status().as_u16();
    match response.bytes().await {
        Ok(body) => serde_json::from_slice::<Problem>(&body).unwrap_or_else(|_| Problem {
            problem_type: None,
            detail: Some(String::from_utf8_lossy(&body).into_owned()),
            status: Some(status),
        }),
        Err(_) => Problem {
            problem_type: None,
            detail: None,
            status: Some(status),
        },
    }
}

fn problem_error(problem: Problem, status: u16) -> EngineError {
    EngineError::AcmeProtocol {
        detail: problem.to_string(),
        status: problem.status.or(Some(status)),
        problem_type: problem.problem_type,
    }
}
