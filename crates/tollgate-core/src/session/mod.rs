//! Session state and the session store.
//!
//! A [`SessionState`] is the unit of identity: everything the gateway
//! knows about one API key. Sessions are serialized as stable JSON and
//! kept behind the [`KeyStore`] contract; the [`SessionManager`] is the
//! only component that reads or writes them.

use crate::storage::{KeyStore, StorageError};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Grants a session access to one API and a set of its versions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessDefinition {
    #[serde(default)]
    pub api_name: String,
    pub api_id: String,
    pub versions: Vec<String>,
}

/// Per-key identity record governing rate, quota and access.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    /// Allowed events per rolling window; zero or negative disables
    /// rate limiting.
    pub rate: f64,
    /// Rolling-window length in seconds.
    pub per: f64,
    /// Legacy local-bucket fields, kept for serialized compatibility.
    /// Enforcement uses the store-side rolling window.
    pub allowance: f64,
    pub last_check: i64,
    /// -1 means unlimited quota.
    pub quota_max: i64,
    pub quota_remaining: i64,
    /// Seconds between quota refills.
    pub quota_renewal_rate: i64,
    /// Absolute epoch seconds of the next refill.
    pub quota_renews: i64,
    /// Absolute epoch seconds; 0 or -1 means the key never expires.
    pub expires: i64,
    /// API id -> access grant. An empty map leaves the key
    /// unrestricted (legacy behaviour); a non-empty map denies any API
    /// without an entry.
    pub access_rights: HashMap<String, AccessDefinition>,
    pub org_id: String,
    pub hmac_enabled: bool,
    pub hmac_secret: String,
    /// Free-form data owned by user middleware.
    pub meta_data: HashMap<String, String>,
    pub alias: String,
    pub tags: Vec<String>,
    pub basic_auth_data: Option<serde_json::Value>,
    pub oauth_data: Option<serde_json::Value>,
}

impl SessionState {
    /// Whether the key itself has lapsed at `now` (epoch seconds).
    pub fn expired_at(&self, now: i64) -> bool {
        self.expires > 0 && now > self.expires
    }
}

struct SessionWrite {
    key: String,
    payload: String,
    ttl: i64,
}

/// Materializes [`SessionState`] records over a [`KeyStore`].
///
/// With `use_async_session_write` enabled, `update_session` returns as
/// soon as the write is queued; a single background worker drains the
/// queue in arrival order, which preserves per-key FIFO ordering.
pub struct SessionManager {
    store: Arc<dyn KeyStore>,
    writer: Option<mpsc::UnboundedSender<SessionWrite>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyStore>, async_writes: bool) -> Self {
        let writer = async_writes.then(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<SessionWrite>();
            let store = store.clone();
            tokio::spawn(async move {
                while let Some(write) = rx.recv().await {
                    if let Err(e) = store.set(&write.key, &write.payload, write.ttl).await {
                        warn!(key = %write.key, error = %e, "async session write failed");
                    }
                }
                debug!("async session writer stopped");
            });
            tx
        });
        Self { store, writer }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub async fn session(&self, key: &str) -> Result<SessionState, StorageError> {
        let raw = self.store.get(key).await?;
        serde_json::from_str(&raw).map_err(|e| {
            warn!(key = %key, error = %e, "stored session is not valid JSON");
            StorageError::Transport(format!("undecodable session record: {e}"))
        })
    }

    pub async fn update_session(
        &self,
        key: &str,
        session: &SessionState,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(session)
            .map_err(|e| StorageError::Transport(format!("unencodable session record: {e}")))?;
        match &self.writer {
            Some(tx) => {
                if tx
                    .send(SessionWrite { key: key.to_string(), payload, ttl: ttl_seconds })
                    .is_err()
                {
                    return Err(StorageError::Transport("session writer stopped".to_string()));
                }
                Ok(())
            }
            None => self.store.set(key, &payload, ttl_seconds).await,
        }
    }

    pub async fn remove_session(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key, error = %e, "session delete failed");
                false
            }
        }
    }

    pub async fn sessions(&self, filter: &str) -> Result<Vec<String>, StorageError> {
        self.store.keys(filter).await
    }
}
