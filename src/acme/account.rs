//! ACME account identity.
//!
//! An account is an URL plus a private signing key provisioned out-of-band
//! by an operator, one per environment. The engine loads it from the
//! certificate store and never writes it back.

use crate::acme::b64url;
use crate::config::Environment;
use crate::error::{EngineError, EngineResult};
use crate::store::{CertificateStore, ACCOUNT_PRIVATE_KEY_KEY, ACCOUNT_URL_KEY};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::sign::Signer;
use sha2::{Digest, Sha256};
use tracing::info;

/// ES256 signatures carry two 32-byte scalars.
const ES256_COORD_LEN: usize = 32;

/// JWS signature algorithm derived from the account key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256 (RSA keys).
    Rs256,
    /// ECDSA P-256 with SHA-256 (EC keys).
    Es256,
}

impl JwsAlgorithm {
    /// The `alg` value carried in JWS protected headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Es256 => "ES256",
        }
    }
}

/// An account private key, RSA or EC P-256.
pub struct AccountKey {
    pkey: PKey<Private>,
    algorithm: JwsAlgorithm,
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("algorithm", &self.algorithm.as_str())
            .finish_non_exhaustive()
    }
}

impl AccountKey {
    /// Load a private key from PEM. Accepts PKCS#8 as well as the
    /// traditional `RSA PRIVATE KEY` / `EC PRIVATE KEY` encodings.
    pub fn from_pem(pem: &[u8]) -> EngineResult<Self> {
        let pkey = PKey::private_key_from_pem(pem)?;

        let algorithm = match pkey.id() {
            Id::RSA => JwsAlgorithm::Rs256,
            Id::EC => {
                let curve = pkey.ec_key()?.group().curve_name();
                if curve != Some(Nid::X9_62_PRIME256V1) {
                    return Err(EngineError::Crypto(format!(
                        "unsupported EC curve {:?}, expected P-256",
                        curve
                    )));
                }
                JwsAlgorithm::Es256
            },
            other => {
                return Err(EngineError::Crypto(format!(
                    "unsupported account key type {:?}",
                    other
                )))
            },
        };

        Ok(Self { pkey, algorithm })
    }

    /// The JWS algorithm for this key.
    pub fn algorithm(&self) -> JwsAlgorithm {
        self.algorithm
    }

    /// Public key as a JWK object.
    pub fn public_jwk(&self) -> EngineResult<serde_json::Value> {
        match self.algorithm {
            JwsAlgorithm::Rs256 => {
                let rsa = self.pkey.rsa()?;
                Ok(serde_json::json!({
                    "kty": "RSA",
                    "n": b64url(rsa.n().to_vec()),
                    "e": b64url(rsa.e().to_vec()),
                }))
            },
            JwsAlgorithm::Es256 => {
                let ec = self.pkey.ec_key()?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates(ec.group(), &mut x, &mut y, &mut ctx)?;
                Ok(serde_json::json!({
                    "kty": "EC",
                    "crv": "P-256",
                    "x": b64url(x.to_vec_padded(ES256_COORD_LEN as i32)?),
                    "y": b64url(y.to_vec_padded(ES256_COORD_LEN as i32)?),
                }))
            },
        }
    }

    /// RFC 7638 JWK thumbprint, base64url encoded.
    ///
    /// Relies on serde_json's sorted object keys for the required
    /// lexicographic member ordering.
    pub fn thumbprint(&self) -> EngineResult<String> {
        let jwk = self.public_jwk()?;
        let canonical = serde_json::to_string(&jwk)
            .map_err(|err| EngineError::Crypto(err.to_string()))?;
        Ok(b64url(Sha256::digest(canonical.as_bytes())))
    }

    /// Key authorization for a challenge token: `token.thumbprint`.
    pub fn key_authorization(&self, token: &str) -> EngineResult<String> {
        Ok(format!("{}.{}", token, self.thumbprint()?))
    }

    /// Sign data for a JWS envelope.
    ///
    /// RS256 yields the PKCS#1 signature as-is; ES256 converts the DER
    /// ECDSA signature into the fixed-width `r || s` form JWS requires.
    pub fn sign(&self, data: &[u8]) -> EngineResult<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        let signature = signer.sign_oneshot_to_vec(data)?;

        match self.algorithm {
            JwsAlgorithm::Rs256 => Ok(signature),
            JwsAlgorithm::Es256 => {
                let ecdsa = EcdsaSig::from_der(&signature)?;
                let mut raw = ecdsa.r().to_vec_padded(ES256_COORD_LEN as i32)?;
                raw.extend(ecdsa.s().to_vec_padded(ES256_COORD_LEN as i32)?);
                Ok(raw)
            },
        }
    }
}

/// Credentials of a provisioned ACME account.
#[derive(Debug)]
pub struct AccountCredentials {
    /// Account URL assigned by the ACME server at registration.
    pub url: String,
    /// Private signing key.
    pub key: AccountKey,
}

impl AccountCredentials {
    /// Load the account for an environment from the certificate store.
    ///
    /// The secret must carry both the signing key and the account URL; a
    /// missing secret or missing entry is `AccountNotConfigured`, which is
    /// not retryable without operator intervention.
    pub fn load(
        store: &dyn CertificateStore,
        environment: Environment,
        namespace: &str,
    ) -> EngineResult<Self> {
        let secret_name = environment.account_secret_name();
        let secret = store
            .get(secret_name, namespace)?
            .ok_or(EngineError::AccountNotConfigured { environment })?;

        let key_pem = secret
            .get(ACCOUNT_PRIVATE_KEY_KEY)
            .ok_or(EngineError::AccountNotConfigured { environment })?;
        let key = AccountKey::from_pem(key_pem)?;

        let url = secret
            .get_string(ACCOUNT_URL_KEY)
            .ok_or(EngineError::AccountNotConfigured { environment })?;
        // Operators tend to create the URL entry with a trailing newline.
        let url = url.trim_end_matches('\n').to_string();

        info!(
            environment = %environment,
            secret = secret_name,
            algorithm = key.algorithm().as_str(),
            "loaded ACME account"
        );

        Ok(Self { url, key })
    }
}
