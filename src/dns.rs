//! DNS provisioning collaborator contract.
//!
//! Publishing the `_acme-challenge` TXT record is the job of an external
//! provider plugin. The engine only depends on this trait: `publish` must
//! not return until the provider reports the record as propagated, because
//! the challenge is submitted to the ACME server immediately afterwards.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// TXT record name for a domain's DNS-01 challenge.
///
/// Wildcard requests validate against the base domain, so a leading `*.`
/// label is dropped.
pub fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

/// DNS provider contract for DNS-01 validation records.
#[async_trait]
pub trait DnsProvisioner: Send + Sync {
    /// Create the `_acme-challenge` TXT record for `domain` carrying
    /// `txt_value`, wait for provider-reported propagation, and return an
    /// identifier usable for later withdrawal.
    async fn publish(&self, domain: &str, txt_value: &str) -> EngineResult<String>;

    /// Delete a previously published record.
    async fn withdraw(&self, record_id: &str) -> EngineResult<()>;
}

/// In-memory provisioner for tests and dry runs. Records every publish and
/// withdrawal instead of talking to a real DNS backend.
#[derive(Debug, Default)]
pub struct MemoryDnsProvisioner {
    records: Mutex<HashMap<String, (String, String)>>,
    next_id: Mutex<u64>,
}

impl MemoryDnsProvisioner {
    /// Create an empty provisioner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published `(record name, value)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.records
            .lock()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records currently published.
    pub fn published_count(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DnsProvisioner for MemoryDnsProvisioner {
    async fn publish(&self, domain: &str, txt_value: &str) -> EngineResult<String> {
        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| EngineError::Dns("lock poisoned".to_string()))?;
        *next_id += 1;
        let id = format!("rec-{}", *next_id);

        self.records
            .lock()
            .map_err(|_| EngineError::Dns("lock poisoned".to_string()))?
            .insert(
                id.clone(),
                (challenge_record_name(domain), txt_value.to_string()),
            );
        Ok(id)
    }

    async fn withdraw(&self, record_id: &str) -> EngineResult<()> {
        self.records
            .lock()
            .map_err(|_| EngineError::Dns("lock poisoned".to_string()))?
            .remove(record_id);
        Ok(())
    }
}
