//! End-to-end issuance tests against an in-process ACME server.
//!
//! The fake server implements the transport contract, validates that the
//! engine really published the expected `_acme-challenge` TXT digest before
//! submitting each challenge, and signs certificates with its own CA so the
//! issued chain can be parsed like a real one.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use certminder::acme::{
    AccountCredentials, AccountKey, AcmeTransport, AuthorizationResource, AuthorizationStatus,
    ChallengeResource, ChallengeStatus, Identifier, OrderResource, OrderStatus, DNS01,
};
use certminder::dns::{challenge_record_name, DnsProvisioner, MemoryDnsProvisioner};
use certminder::engine::{CertificateRequest, LifecycleEngine, ReconcileOutcome};
use certminder::store::{
    CertificateStore, MemoryCertificateStore, Secret, ACCOUNT_PRIVATE_KEY_KEY, ACCOUNT_URL_KEY,
    TLS_CERTIFICATE_KEY, TLS_PRIVATE_KEY_KEY,
};
use certminder::{EngineConfig, EngineError, EngineResult, Environment, ParsedCertificate};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const OPERATOR_NAMESPACE: &str = "certminder";

/// In-process ACME server state.
struct FakeAcmeServer {
    /// Thumbprint of the one account this server knows.
    account_thumbprint: String,
    /// DNS zone the server "queries" during validation.
    dns: Arc<MemoryDnsProvisioner>,
    /// Validity window of issued certificates.
    validity_days: i64,
    ca_key_pem: String,
    next_id: AtomicU64,
    orders: Mutex<HashMap<String, FakeOrder>>,
    challenges: Mutex<HashMap<String, FakeChallenge>>,
}

struct FakeOrder {
    domains: Vec<String>,
    authorizations: Vec<String>,
    status: OrderStatus,
    certificate_url: Option<String>,
    chain_pem: Option<String>,
}

struct FakeChallenge {
    domain: String,
    token: String,
    status: ChallengeStatus,
}

impl FakeAcmeServer {
    fn new(account_thumbprint: String, dns: Arc<MemoryDnsProvisioner>, validity_days: i64) -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        Self {
            account_thumbprint,
            dns,
            validity_days,
            ca_key_pem: ca_key.serialize_pem(),
            next_id: AtomicU64::new(1),
            orders: Mutex::new(HashMap::new()),
            challenges: Mutex::new(HashMap::new()),
        }
    }

    fn expected_txt_digest(&self, token: &str) -> String {
        let key_authorization = format!("{}.{}", token, self.account_thumbprint);
        URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
    }

    fn txt_record_is_published(&self, domain: &str, token: &str) -> bool {
        let expected = (
            challenge_record_name(domain),
            self.expected_txt_digest(token),
        );
        self.dns.published().contains(&expected)
    }

    fn issue_chain(&self, domains: &[String]) -> String {
        let ca_key = rcgen::KeyPair::from_pem(&self.ca_key_pem).unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::OrganizationName, "Let's Encrypt");
        dn.push(rcgen::DnType::CommonName, "Fake Issuing CA");
        ca_params.distinguished_name = dn;
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let mut leaf_params = rcgen::CertificateParams::new(domains.to_vec()).unwrap();
        leaf_params.not_before = time::OffsetDateTime::now_utc();
        leaf_params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(self.validity_days);
        let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        format!("{}{}", leaf.pem(), ca_cert.pem())
    }
}

#[async_trait]
impl AcmeTransport for FakeAcmeServer {
    async fn create_order(
        &self,
        _account: &AccountCredentials,
        identifiers: &[Identifier],
    ) -> EngineResult<(String, OrderResource)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order_url = format!("https://fake-acme.test/order/{}", id);
        let domains: Vec<String> = identifiers.iter().map(|i| i.value.clone()).collect();

        let mut authorizations = Vec::new();
        for (index, domain) in domains.iter().enumerate() {
            let authz_url = format!("https://fake-acme.test/authz/{}/{}", id, index);
            let challenge_url = format!("https://fake-acme.test/chall/{}/{}", id, index);
            self.challenges.lock().unwrap().insert(
                challenge_url,
                FakeChallenge {
                    domain: domain.clone(),
                    token: format!("token-{}-{}", id, index),
                    status: ChallengeStatus::Pending,
                },
            );
            authorizations.push(authz_url);
        }

        let resource = OrderResource {
            status: OrderStatus::Pending,
            identifiers: identifiers.to_vec(),
            authorizations: authorizations.clone(),
            finalize: format!("https://fake-acme.test/finalize/{}", id),
            certificate: None,
            expires: None,
            error: None,
        };
        self.orders.lock().unwrap().insert(
            order_url.clone(),
            FakeOrder {
                domains,
                authorizations,
                status: OrderStatus::Pending,
                certificate_url: None,
                chain_pem: None,
            },
        );
        Ok((order_url, resource))
    }

    async fn fetch_order(
        &self,
        _account: &AccountCredentials,
        order_url: &str,
    ) -> EngineResult<OrderResource> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_url).expect("unknown order");

        // Finalized orders complete on the next poll.
        if order.status == OrderStatus::Processing {
            order.status = OrderStatus::Valid;
            order.certificate_url = Some(format!("{}/certificate", order_url));
        }

        Ok(OrderResource {
            status: order.status,
            identifiers: order.domains.iter().map(Identifier::dns).collect(),
            authorizations: order.authorizations.clone(),
            finalize: format!(
                "https://fake-acme.test/finalize/{}",
                order_url.rsplit('/').next().unwrap()
            ),
            certificate: order.certificate_url.clone(),
            expires: None,
            error: None,
        })
    }

    async fn fetch_authorization(
        &self,
        _account: &AccountCredentials,
        authorization_url: &str,
    ) -> EngineResult<AuthorizationResource> {
        let challenge_url = authorization_url.replace("/authz/", "/chall/");
        let challenges = self.challenges.lock().unwrap();
        let challenge = challenges.get(&challenge_url).expect("unknown authz");

        let status = if challenge.status == ChallengeStatus::Valid {
            AuthorizationStatus::Valid
        } else {
            AuthorizationStatus::Pending
        };
        let wildcard = challenge.domain.starts_with("*.");

        Ok(AuthorizationResource {
            identifier: Identifier::dns(challenge.domain.trim_start_matches("*.")),
            status,
            challenges: vec![ChallengeResource {
                kind: DNS01.to_string(),
                url: challenge_url.clone(),
                status: challenge.status,
                token: challenge.token.clone(),
                error: None,
            }],
            wildcard,
            expires: None,
        })
    }

    async fn submit_challenge(
        &self,
        _account: &AccountCredentials,
        challenge_url: &str,
    ) -> EngineResult<ChallengeResource> {
        let mut challenges = self.challenges.lock().unwrap();
        let challenge = challenges.get_mut(challenge_url).expect("unknown challenge");
        challenge.status = ChallengeStatus::Processing;
        Ok(ChallengeResource {
            kind: DNS01.to_string(),
            url: challenge_url.to_string(),
            status: challenge.status,
            token: challenge.token.clone(),
            error: None,
        })
    }

    async fn fetch_challenge(
        &self,
        _account: &AccountCredentials,
        challenge_url: &str,
    ) -> EngineResult<ChallengeResource> {
        let mut challenges = self.challenges.lock().unwrap();
        let challenge = challenges.get_mut(challenge_url).expect("unknown challenge");

        if challenge.status == ChallengeStatus::Processing {
            // The server looks the TXT record up exactly once.
            challenge.status =
                if self.txt_record_is_published(&challenge.domain, &challenge.token) {
                    ChallengeStatus::Valid
                } else {
                    ChallengeStatus::Invalid
                };
        }

        let error = (challenge.status == ChallengeStatus::Invalid).then(|| {
            certminder::acme::Problem {
                problem_type: Some("urn:ietf:params:acme:error:unauthorized".to_string()),
                detail: Some(format!(
                    "no matching TXT record for {}",
                    challenge_record_name(&challenge.domain)
                )),
                status: Some(403),
            }
        });

        Ok(ChallengeResource {
            kind: DNS01.to_string(),
            url: challenge_url.to_string(),
            status: challenge.status,
            token: challenge.token.clone(),
            error,
        })
    }

    async fn finalize_order(
        &self,
        _account: &AccountCredentials,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> EngineResult<OrderResource> {
        assert!(!csr_der.is_empty(), "finalize received an empty CSR");

        let order_id = finalize_url.rsplit('/').next().unwrap();
        let order_url = format!("https://fake-acme.test/order/{}", order_id);
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(&order_url).expect("unknown order");

        let challenges = self.challenges.lock().unwrap();
        let all_valid = order.authorizations.iter().all(|authz| {
            let challenge_url = authz.replace("/authz/", "/chall/");
            challenges
                .get(&challenge_url)
                .map(|c| c.status == ChallengeStatus::Valid)
                .unwrap_or(false)
        });
        assert!(all_valid, "finalize before all challenges validated");
        drop(challenges);

        order.chain_pem = Some(self.issue_chain(&order.domains));
        order.status = OrderStatus::Processing;

        Ok(OrderResource {
            status: order.status,
            identifiers: order.domains.iter().map(Identifier::dns).collect(),
            authorizations: order.authorizations.clone(),
            finalize: finalize_url.to_string(),
            certificate: None,
            expires: None,
            error: None,
        })
    }

    async fn download_certificate(
        &self,
        _account: &AccountCredentials,
        certificate_url: &str,
    ) -> EngineResult<String> {
        let order_url = certificate_url
            .strip_suffix("/certificate")
            .expect("unexpected certificate URL");
        let orders = self.orders.lock().unwrap();
        Ok(orders
            .get(order_url)
            .and_then(|o| o.chain_pem.clone())
            .expect("certificate not issued yet"))
    }

    async fn update_account(
        &self,
        _account: &AccountCredentials,
        _contacts: &[String],
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn revoke_certificate(
        &self,
        _account: &AccountCredentials,
        _certificate_der: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }
}

/// DNS provisioner that records every publish and can be told to publish a
/// corrupted value, simulating a broken provider.
struct RecordingDns {
    inner: Arc<MemoryDnsProvisioner>,
    corrupt_values: bool,
    history: Mutex<Vec<(String, String)>>,
}

impl RecordingDns {
    fn new(inner: Arc<MemoryDnsProvisioner>) -> Self {
        Self {
            inner,
            corrupt_values: false,
            history: Mutex::new(Vec::new()),
        }
    }

    fn corrupting(inner: Arc<MemoryDnsProvisioner>) -> Self {
        Self {
            corrupt_values: true,
            ..Self::new(inner)
        }
    }

    fn history(&self) -> Vec<(String, String)> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsProvisioner for RecordingDns {
    async fn publish(&self, domain: &str, txt_value: &str) -> EngineResult<String> {
        let value = if self.corrupt_values {
            "corrupted-digest".to_string()
        } else {
            txt_value.to_string()
        };
        self.history
            .lock()
            .unwrap()
            .push((challenge_record_name(domain), value.clone()));
        self.inner.publish(domain, &value).await
    }

    async fn withdraw(&self, record_id: &str) -> EngineResult<()> {
        self.inner.withdraw(record_id).await
    }
}

struct Harness {
    store: Arc<MemoryCertificateStore>,
    zone: Arc<MemoryDnsProvisioner>,
    dns: Arc<RecordingDns>,
    engine: LifecycleEngine,
}

fn account_key_pem() -> Vec<u8> {
    let group =
        openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
    openssl::ec::EcKey::generate(&group)
        .unwrap()
        .private_key_to_pem()
        .unwrap()
}

fn setup(validity_days: i64, corrupt_dns: bool) -> Harness {
    let store = Arc::new(MemoryCertificateStore::new());

    let key_pem = account_key_pem();
    let thumbprint = AccountKey::from_pem(&key_pem).unwrap().thumbprint().unwrap();
    store
        .put(
            Secret::new(
                Environment::Staging.account_secret_name(),
                OPERATOR_NAMESPACE,
            )
            .with_data(ACCOUNT_PRIVATE_KEY_KEY, key_pem)
            .with_data(ACCOUNT_URL_KEY, b"https://fake-acme.test/acct/1\n".to_vec()),
        )
        .unwrap();

    let zone = Arc::new(MemoryDnsProvisioner::new());
    let dns = Arc::new(if corrupt_dns {
        RecordingDns::corrupting(Arc::clone(&zone))
    } else {
        RecordingDns::new(Arc::clone(&zone))
    });
    let server = Arc::new(FakeAcmeServer::new(thumbprint, Arc::clone(&zone), validity_days));

    let config = EngineConfig {
        operator_namespace: OPERATOR_NAMESPACE.to_string(),
        challenge_poll_interval_secs: 0,
        order_poll_interval_secs: 0,
        verify_issuer: true,
        ..EngineConfig::default()
    };

    let engine = LifecycleEngine::new(
        Arc::clone(&store) as Arc<dyn CertificateStore>,
        server,
        Arc::clone(&dns) as Arc<dyn DnsProvisioner>,
        config,
    );

    Harness {
        store,
        zone,
        dns,
        engine,
    }
}

fn request(domains: Vec<&str>) -> CertificateRequest {
    CertificateRequest {
        name: "ingress-cert".to_string(),
        namespace: "openshift-ingress".to_string(),
        domains: domains.into_iter().map(|d| d.to_string()).collect(),
        secret_name: "ingress-cert-tls".to_string(),
        renew_before_days: 0,
        environment: Environment::Staging,
    }
}

fn seed_certificate(store: &MemoryCertificateStore, valid_days: i64) -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec!["apps.example.com".to_string()]).unwrap();
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(valid_days);
    let pem = params.self_signed(&key).unwrap().pem();

    store
        .put(
            Secret::new("ingress-cert-tls", "openshift-ingress")
                .with_data(TLS_CERTIFICATE_KEY, pem.clone().into_bytes())
                .with_data(TLS_PRIVATE_KEY_KEY, b"old-key".to_vec()),
        )
        .unwrap();
    pem
}

#[tokio::test]
async fn issues_certificate_when_none_is_stored() {
    let harness = setup(90, false);

    let outcome = harness
        .engine
        .reconcile(&request(vec!["apps.example.com"]))
        .await
        .unwrap();

    let issued = match outcome {
        ReconcileOutcome::Issued(issued) => issued,
        other => panic!("expected issuance, got {:?}", other),
    };

    // Round-trip: notAfter matches the server's validity window.
    let remaining = issued.certificate.not_after - chrono::Utc::now();
    assert!(remaining.num_days() >= 89 && remaining.num_days() <= 90);
    assert!(issued.certificate.issued_by_lets_encrypt());

    // Persisted chain and key.
    let secret = harness
        .store
        .get("ingress-cert-tls", "openshift-ingress")
        .unwrap()
        .unwrap();
    let stored_chain = secret.get_string(TLS_CERTIFICATE_KEY).unwrap();
    assert_eq!(stored_chain, issued.chain_pem);
    assert!(secret
        .get_string(TLS_PRIVATE_KEY_KEY)
        .unwrap()
        .contains("PRIVATE KEY"));

    // The stored chain parses back to the same leaf.
    let reparsed = ParsedCertificate::parse(stored_chain.as_bytes()).unwrap();
    assert_eq!(reparsed.not_after, issued.certificate.not_after);

    // Challenge records were published and then withdrawn.
    assert_eq!(harness.dns.history().len(), 1);
    assert_eq!(harness.zone.published_count(), 0);
}

#[tokio::test]
async fn issues_wildcard_and_multi_domain_orders() {
    let harness = setup(90, false);

    let outcome = harness
        .engine
        .reconcile(&request(vec!["*.apps.example.com", "api.example.com"]))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Issued(_)));

    let history = harness.dns.history();
    assert_eq!(history.len(), 2);
    // Wildcard challenges land on the base name.
    assert_eq!(history[0].0, "_acme-challenge.apps.example.com");
    assert_eq!(history[1].0, "_acme-challenge.api.example.com");
    assert_eq!(harness.zone.published_count(), 0);
}

#[tokio::test]
async fn renews_expiring_certificate_in_place() {
    let harness = setup(90, false);
    let old_pem = seed_certificate(&harness.store, 10);

    let outcome = harness
        .engine
        .reconcile(&request(vec!["apps.example.com"]))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Issued(_)));

    let secret = harness
        .store
        .get("ingress-cert-tls", "openshift-ingress")
        .unwrap()
        .unwrap();
    let stored = secret.get_string(TLS_CERTIFICATE_KEY).unwrap();
    assert_ne!(stored, old_pem);

    let renewed = ParsedCertificate::parse(stored.as_bytes()).unwrap();
    let remaining = renewed.not_after - chrono::Utc::now();
    assert!(remaining.num_days() >= 89);
}

#[tokio::test]
async fn leaves_valid_certificate_alone() {
    let harness = setup(90, false);
    let old_pem = seed_certificate(&harness.store, 80);

    let outcome = harness
        .engine
        .reconcile(&request(vec!["apps.example.com"]))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::UpToDate));

    // Nothing touched, no DNS activity.
    let secret = harness
        .store
        .get("ingress-cert-tls", "openshift-ingress")
        .unwrap()
        .unwrap();
    assert_eq!(secret.get_string(TLS_CERTIFICATE_KEY).unwrap(), old_pem);
    assert!(harness.dns.history().is_empty());
}

#[tokio::test]
async fn failed_validation_leaves_previous_certificate_untouched() {
    let harness = setup(90, true);
    let old_pem = seed_certificate(&harness.store, 10);

    let err = harness
        .engine
        .reconcile(&request(vec!["apps.example.com"]))
        .await
        .unwrap_err();
    match err {
        EngineError::ChallengeValidationFailed { domain, .. } => {
            assert_eq!(domain, "apps.example.com");
        },
        other => panic!("unexpected error: {:?}", other),
    }

    // Previous material intact, challenge record cleaned up.
    let secret = harness
        .store
        .get("ingress-cert-tls", "openshift-ingress")
        .unwrap()
        .unwrap();
    assert_eq!(secret.get_string(TLS_CERTIFICATE_KEY).unwrap(), old_pem);
    assert_eq!(secret.get(TLS_PRIVATE_KEY_KEY), Some(b"old-key".as_slice()));
    assert_eq!(harness.zone.published_count(), 0);
}

#[tokio::test]
async fn missing_staging_account_fails_before_any_acme_traffic() {
    // A store holding only the production account.
    let store = Arc::new(MemoryCertificateStore::new());
    store
        .put(
            Secret::new(
                Environment::Production.account_secret_name(),
                OPERATOR_NAMESPACE,
            )
            .with_data(ACCOUNT_PRIVATE_KEY_KEY, account_key_pem())
            .with_data(ACCOUNT_URL_KEY, b"https://fake-acme.test/acct/9".to_vec()),
        )
        .unwrap();

    let zone = Arc::new(MemoryDnsProvisioner::new());
    let engine = LifecycleEngine::new(
        Arc::clone(&store) as Arc<dyn CertificateStore>,
        Arc::new(FakeAcmeServer::new("thumb".to_string(), Arc::clone(&zone), 90)),
        zone.clone(),
        EngineConfig {
            operator_namespace: OPERATOR_NAMESPACE.to_string(),
            ..EngineConfig::default()
        },
    );

    let err = engine
        .reconcile(&request(vec!["apps.example.com"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AccountNotConfigured {
            environment: Environment::Staging
        }
    ));
}
