//! In-memory [`KeyStore`] used by the test suites.
//!
//! A single [`MemoryBackend`] is shared between any number of
//! [`MemoryStore`] views, each carrying its own [`KeyNamespace`], the
//! same way several prefixed store handles share one Redis database.

use super::{KeyNamespace, KeyStore, MessageHandler, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Shared state behind every [`MemoryStore`] view.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    lists: DashMap<String, Vec<String>>,
    windows: DashMap<String, Vec<i64>>,
    subscribers: DashMap<String, Vec<MessageHandler>>,
}

/// A prefixed view over a shared [`MemoryBackend`].
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    ns: KeyNamespace,
}

impl MemoryStore {
    pub fn new(backend: Arc<MemoryBackend>, ns: KeyNamespace) -> Self {
        Self { backend, ns }
    }

    /// Convenience constructor for single-store tests.
    pub fn unprefixed() -> Self {
        Self::new(Arc::new(MemoryBackend::default()), KeyNamespace::new("", false))
    }

    fn ttl_to_deadline(ttl_seconds: i64) -> Option<Instant> {
        if ttl_seconds > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_seconds as u64))
        } else {
            None
        }
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, StorageError> {
        let physical = self.ns.render(key);
        // The read guard must drop before any removal on the same key.
        let live = self
            .backend
            .entries
            .get(&physical)
            .map(|entry| entry.live().then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Ok(value),
            Some(None) => {
                self.backend.entries.remove(&physical);
                Err(StorageError::NotFound)
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), StorageError> {
        self.backend.entries.insert(
            self.ns.render(key),
            Entry { value: value.to_string(), expires_at: Self::ttl_to_deadline(ttl_seconds) },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.backend.entries.remove(&self.ns.render(key)).is_some())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<bool, StorageError> {
        let mut removed = false;
        for key in keys {
            removed |= self.backend.entries.remove(&self.ns.render(key)).is_some();
        }
        Ok(removed)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<bool, StorageError> {
        let physical = self.ns.render(prefix);
        let before = self.backend.entries.len();
        self.backend.entries.retain(|k, _| !k.starts_with(&physical));
        Ok(self.backend.entries.len() != before)
    }

    async fn keys(&self, filter: &str) -> Result<Vec<String>, StorageError> {
        let physical = self.ns.render(filter);
        Ok(self
            .backend
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&physical) && e.value().live())
            .map(|e| self.ns.strip(e.key()).to_string())
            .collect())
    }

    async fn increment_with_expire(
        &self,
        key: &str,
        ttl_seconds: i64,
    ) -> Result<i64, StorageError> {
        let physical = self.ns.render(key);
        let mut entry = self.backend.entries.entry(physical).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: Self::ttl_to_deadline(ttl_seconds),
        });
        if !entry.live() {
            entry.value = "0".to_string();
            entry.expires_at = Self::ttl_to_deadline(ttl_seconds);
        }
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn append_to_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.backend
            .lists
            .entry(self.ns.render(key))
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn get_and_delete_set(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .backend
            .lists
            .remove(&self.ns.render(key))
            .map(|(_, values)| values)
            .unwrap_or_default())
    }

    async fn set_rolling_window(
        &self,
        key: &str,
        per_seconds: i64,
        now_ns: i64,
    ) -> Result<usize, StorageError> {
        let mut window = self.backend.windows.entry(self.ns.render(key)).or_default();
        let horizon = now_ns - per_seconds.saturating_mul(1_000_000_000);
        window.retain(|&ts| ts >= horizon);
        window.push(now_ns);
        Ok(window.len())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        if let Some(handlers) = self.backend.subscribers.get(channel) {
            for handler in handlers.iter() {
                handler(channel.to_string(), message.to_string());
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<(), StorageError> {
        self.backend
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }
}
