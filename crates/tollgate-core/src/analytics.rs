//! Request analytics.
//!
//! One record per proxied request, appended to a store-backed queue for
//! an external purger to drain. Recording is fail-open: a storage error
//! here is logged and the request outcome is unaffected.

use crate::storage::KeyStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::HashSet, sync::Arc};
use tracing::warn;

/// The queue key inside the analytics namespace.
const QUEUE_KEY: &str = "records";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsRecord {
    pub method: String,
    pub path: String,
    pub response_code: u16,
    pub latency_ms: i64,
    /// SHA-256 of the raw key; credentials never reach the queue.
    pub key_hash: String,
    pub api_id: String,
    pub org_id: String,
    pub timestamp: i64,
}

pub fn hash_key(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub struct AnalyticsRecorder {
    store: Arc<dyn KeyStore>,
    enabled: bool,
    ignored_ips: HashSet<String>,
}

impl AnalyticsRecorder {
    pub fn new(store: Arc<dyn KeyStore>, enabled: bool, ignored_ips: Vec<String>) -> Self {
        Self { store, enabled, ignored_ips: ignored_ips.into_iter().collect() }
    }

    /// Whether a request from this client should be recorded.
    pub fn should_record(&self, client_ip: Option<&str>) -> bool {
        if !self.enabled {
            return false;
        }
        match client_ip {
            Some(ip) => !self.ignored_ips.contains(ip),
            None => true,
        }
    }

    /// Queues a record without blocking the response path.
    pub fn record(self: &Arc<Self>, record: AnalyticsRecord, client_ip: Option<&str>) {
        if !self.should_record(client_ip) {
            return;
        }
        let recorder = self.clone();
        tokio::spawn(async move {
            let payload = match serde_json::to_string(&record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "analytics record failed to encode");
                    return;
                }
            };
            if let Err(e) = recorder.store.append_to_set(QUEUE_KEY, &payload).await {
                warn!(error = %e, "analytics append failed");
            }
        });
    }

    /// Drains the queue; used by the external purger.
    pub async fn drain(&self) -> Vec<AnalyticsRecord> {
        match self.store.get_and_delete_set(QUEUE_KEY).await {
            Ok(raw) => raw
                .iter()
                .filter_map(|entry| match serde_json::from_str(entry) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable analytics record");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "analytics drain failed");
                Vec::new()
            }
        }
    }
}
