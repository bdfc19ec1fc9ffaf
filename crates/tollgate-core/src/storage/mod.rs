//! Key/value storage contract shared by every gateway component.
//!
//! All persistent state (sessions, rate windows, health counters, the
//! analytics queue) goes through the [`KeyStore`] trait. Three
//! implementations exist:
//!
//! - [`redis::RedisStore`]: a pooled Redis client, optionally
//!   cluster-sharded, used when the gateway owns its own store.
//! - [`rpc::RpcStore`]: a long-lived RPC connection to a remote control
//!   plane with a local read cache and keyspace invalidation.
//! - [`memory::MemoryStore`]: an in-process store for tests.
//!
//! Callers never see transport payloads as data: every failure surfaces
//! as a typed [`StorageError`].

pub mod memory;
pub mod redis;
pub mod rpc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Errors surfaced by [`KeyStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The key does not exist in the store.
    #[error("key not found")]
    NotFound,

    /// The store could not be reached or returned a malformed reply.
    #[error("storage transport error: {0}")]
    Transport(String),
}

/// Callback invoked with `(channel, message)` for every pub/sub delivery.
pub type MessageHandler = Box<dyn Fn(String, String) + Send + Sync>;

/// The storage surface the gateway core consumes.
///
/// Implementations must guarantee that `increment_with_expire` and
/// `set_rolling_window` are atomic against concurrent callers on the
/// same key, and that every operation is observed by any concurrent
/// caller after it returns.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, StorageError>;

    /// Stores `value` under `key`. A `ttl_seconds` of 0 uses the store
    /// default; a negative value means no expiry.
    async fn set(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete_keys(&self, keys: &[String]) -> Result<bool, StorageError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<bool, StorageError>;

    /// Lists logical keys matching the given prefix filter (the store's
    /// own prefix is stripped from the result).
    async fn keys(&self, filter: &str) -> Result<Vec<String>, StorageError>;

    /// Atomic counter. The TTL is applied only when the increment
    /// creates the key.
    async fn increment_with_expire(&self, key: &str, ttl_seconds: i64)
        -> Result<i64, StorageError>;

    async fn append_to_set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn get_and_delete_set(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Rolling-window insert: atomically drops members older than
    /// `now_ns - per_seconds * 1e9`, records `now_ns`, refreshes the
    /// key TTL to `per_seconds` and returns the post-insert cardinality.
    async fn set_rolling_window(
        &self,
        key: &str,
        per_seconds: i64,
        now_ns: i64,
    ) -> Result<usize, StorageError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError>;

    async fn subscribe(&self, channel: &str, handler: MessageHandler)
        -> Result<(), StorageError>;
}

/// Maps logical keys to physical store keys.
///
/// Every store instance carries a namespace: a component prefix
/// (`apikey-`, `apihealth.`, `orgKey.`, `analytics-`) plus an optional
/// hashing step. When `hash_keys` is on, the key portion after the
/// prefix is the SHA-256 hex digest of the raw key, so raw credentials
/// never appear in the store.
#[derive(Clone, Debug)]
pub struct KeyNamespace {
    pub prefix: String,
    pub hash_keys: bool,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>, hash_keys: bool) -> Self {
        Self { prefix: prefix.into(), hash_keys }
    }

    /// Physical key for a logical key.
    pub fn render(&self, key: &str) -> String {
        format!("{}{}", self.prefix, self.hash(key))
    }

    /// Match pattern for a logical prefix scan.
    pub fn render_filter(&self, filter: &str) -> String {
        format!("{}{}*", self.prefix, self.hash(filter))
    }

    /// Strips the namespace prefix from a physical key.
    pub fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    fn hash<'a>(&self, key: &'a str) -> Cow<'a, str> {
        if !self.hash_keys {
            return Cow::Borrowed(key);
        }
        let digest = Sha256::digest(key.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        Cow::Owned(out)
    }
}
