//! Certificate store accessor.
//!
//! The engine reads and writes certificate material and ACME account data
//! through an opaque secret-like key/value store. Only the contract is owned
//! here; production backends (Kubernetes secrets, vaults) implement
//! [`CertificateStore`] outside this crate.

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::RwLock;

/// Secret key under which the PEM certificate chain is stored.
pub const TLS_CERTIFICATE_KEY: &str = "tls.crt";

/// Secret key under which the certificate's PEM private key is stored.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Secret key under which an ACME account's PEM signing key is stored.
pub const ACCOUNT_PRIVATE_KEY_KEY: &str = "private-key";

/// Secret key under which an ACME account's URL is stored.
pub const ACCOUNT_URL_KEY: &str = "account-url";

/// An opaque secret: a named key/value map scoped to a namespace.
#[derive(Debug, Clone, Default)]
pub struct Secret {
    /// Secret name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Secret data.
    pub data: HashMap<String, Vec<u8>>,
}

impl Secret {
    /// Create an empty secret.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data: HashMap::new(),
        }
    }

    /// Add a data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Get a data entry.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    /// Get a data entry as a UTF-8 string.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
    }
}

/// Store contract consumed by the engine.
///
/// `get` returning `Ok(None)` means the secret does not exist; transport or
/// backend failures are `Err`. Writes are whole-secret replacements.
pub trait CertificateStore: Send + Sync {
    /// Fetch a secret, or `None` if it does not exist.
    fn get(&self, name: &str, namespace: &str) -> EngineResult<Option<Secret>>;

    /// Create a new secret. Fails if one already exists under the same name.
    fn put(&self, secret: Secret) -> EngineResult<()>;

    /// Replace an existing secret. Fails if none exists.
    fn update(&self, secret: Secret) -> EngineResult<()>;
}

/// In-memory store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    secrets: RwLock<HashMap<(String, String), Secret>>,
}

impl MemoryCertificateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn get(&self, name: &str, namespace: &str) -> EngineResult<Option<Secret>> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| EngineError::Store("lock poisoned".to_string()))?;
        Ok(secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    fn put(&self, secret: Secret) -> EngineResult<()> {
        let mut secrets = self
            .secrets
            .write()
            .map_err(|_| EngineError::Store("lock poisoned".to_string()))?;
        let key = (secret.namespace.clone(), secret.name.clone());
        if secrets.contains_key(&key) {
            return Err(EngineError::Store(format!(
                "secret {}/{} already exists",
                secret.namespace, secret.name
            )));
        }
        secrets.insert(key, secret);
        Ok(())
    }

    fn update(&self, secret: Secret) -> EngineResult<()> {
        let mut secrets = self
            .secrets
            .write()
            .map_err(|_| EngineError::Store("lock poisoned".to_string()))?;
        let key = (secret.namespace.clone(), secret.name.clone());
        if !secrets.contains_key(&key) {
            return Err(EngineError::Store(format!(
                "secret {}/{} does not exist",
                secret.namespace, secret.name
            )));
        }
        secrets.insert(key, secret);
        Ok(())
    }
}
