//! RPC-backed [`KeyStore`] for gateways run as edge nodes of a remote
//! control plane.
//!
//! The wire protocol is length-prefixed JSON frames over one long-lived
//! TCP connection: requests carry `{id, method, params}`, responses
//! `{id, result, error}`. The sentinel error string `"Access Denied"`
//! means the login lease lapsed; the client re-logs-in and retries the
//! call exactly once. Transport failures mark the connection dead;
//! the next call redials with backoff (100 ms, 400 ms, 1.6 s) before
//! giving up.
//!
//! A local TTL cache (30 s, swept every 15 s) fronts `get` when
//! enabled. Writes invalidate the affected key but never populate the
//! cache; the keyspace poller evicts keys the control plane reports as
//! changed.

use super::{KeyNamespace, KeyStore, MessageHandler, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, oneshot, Mutex},
};
use tracing::{debug, info, warn};

/// The lease-lapse sentinel; part of the wire contract.
pub const ACCESS_DENIED: &str = "Access Denied";

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const REDIAL_ATTEMPTS: u32 = 3;
const REDIAL_BASE_DELAY: Duration = Duration::from_millis(100);

const CACHE_TTL: Duration = Duration::from_secs(30);
const CACHE_SWEEP: Duration = Duration::from_secs(15);

pub const KEYSPACE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Parameter record shared by the write-side procedures.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InboundData {
    pub key_name: String,
    pub value: String,
    pub session_state: String,
    pub timeout: i64,
    pub per: i64,
    pub expire: i64,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
pub enum RpcError {
    /// The remote rejected the call because the login lease lapsed.
    AccessDenied,
    /// The remote answered with an application-level error.
    Remote(String),
    /// The connection failed mid-call.
    Transport(String),
}

impl From<RpcError> for StorageError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::AccessDenied => StorageError::Transport(ACCESS_DENIED.to_string()),
            RpcError::Remote(msg) | RpcError::Transport(msg) => StorageError::Transport(msg),
        }
    }
}

struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    pending: DashMap<u64, oneshot::Sender<WireResponse>>,
    closed: AtomicBool,
}

impl Connection {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every in-flight caller with a
        // transport error.
        self.pending.clear();
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn reader_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => match serde_json::from_slice::<WireResponse>(&frame) {
                    Ok(response) => {
                        if let Some((_, tx)) = conn.pending.remove(&response.id) {
                            let _ = tx.send(response);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable RPC frame");
                    }
                },
                Err(e) => {
                    debug!(error = %e, "RPC connection closed");
                    conn.mark_closed();
                    return;
                }
            }
        }
    });
}

/// The transport: one connection, transparent re-login, redial with
/// backoff.
pub struct RpcClient {
    address: String,
    user_key: String,
    conn: Mutex<Option<Arc<Connection>>>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Dials and logs in; fails fast so a bad address or credential is
    /// caught at boot.
    pub async fn connect(address: &str, user_key: &str) -> Result<Arc<Self>, StorageError> {
        let client = Arc::new(Self {
            address: address.to_string(),
            user_key: user_key.to_string(),
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });
        client.ensure_connection().await.map_err(StorageError::from)?;
        info!(address = %address, "RPC store connected");
        Ok(client)
    }

    async fn dial(&self) -> Result<Arc<Connection>, RpcError> {
        let mut delay = REDIAL_BASE_DELAY;
        let mut last_error = String::new();
        for attempt in 0..REDIAL_ATTEMPTS {
            match TcpStream::connect(&self.address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    let conn = Arc::new(Connection {
                        writer: Mutex::new(writer),
                        pending: DashMap::new(),
                        closed: AtomicBool::new(false),
                    });
                    reader_loop(conn.clone(), reader);
                    return Ok(conn);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < REDIAL_ATTEMPTS {
                        warn!(address = %self.address, attempt = attempt + 1, error = %e,
                            "RPC dial failed, backing off");
                        tokio::time::sleep(delay).await;
                        delay *= 4;
                    }
                }
            }
        }
        Err(RpcError::Transport(format!("RPC dial failed: {last_error}")))
    }

    /// Returns a live connection, dialing and logging in when needed.
    async fn ensure_connection(&self) -> Result<Arc<Connection>, RpcError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.closed.load(Ordering::SeqCst) {
                return Ok(conn.clone());
            }
        }
        let conn = self.dial().await?;
        self.login_on(&conn).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn call_on(&self, conn: &Arc<Connection>, method: &str, params: Value)
        -> Result<Value, RpcError>
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_vec(&WireRequest { id, method, params })
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(id, tx);

        {
            let mut writer = conn.writer.lock().await;
            if let Err(e) = write_frame(&mut writer, &frame).await {
                conn.pending.remove(&id);
                conn.mark_closed();
                return Err(RpcError::Transport(format!("RPC write failed: {e}")));
            }
        }

        let response = match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RpcError::Transport("RPC connection lost".to_string())),
            Err(_) => {
                conn.pending.remove(&id);
                return Err(RpcError::Transport("RPC call timed out".to_string()));
            }
        };

        match response.error {
            Some(ref e) if e == ACCESS_DENIED => Err(RpcError::AccessDenied),
            Some(e) => Err(RpcError::Remote(e)),
            None => Ok(response.result),
        }
    }

    async fn login_on(&self, conn: &Arc<Connection>) -> Result<(), RpcError> {
        debug!("RPC login initiated");
        let result = self.call_on(conn, "Login", json!(self.user_key)).await?;
        if result.as_bool() != Some(true) {
            return Err(RpcError::Transport("RPC login rejected".to_string()));
        }
        debug!("RPC login complete");
        Ok(())
    }

    /// One call with the re-login contract: a single `"Access Denied"`
    /// triggers exactly one login and one retry; a second one
    /// surfaces to the caller.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let conn = self.ensure_connection().await?;
        match self.call_on(&conn, method, params.clone()).await {
            Err(RpcError::AccessDenied) => {
                info!(method = %method, "access denied, re-logging in");
                self.login_on(&conn).await?;
                match self.call_on(&conn, method, params).await {
                    Err(RpcError::AccessDenied) => {
                        Err(RpcError::Transport(ACCESS_DENIED.to_string()))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Hook invoked with each invalidated logical key; downstream caches
/// register one to drop their own copies.
pub type InvalidationHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct RpcStore {
    client: Arc<RpcClient>,
    ns: KeyNamespace,
    cache: Arc<DashMap<String, CacheEntry>>,
    enable_cache: bool,
}

impl RpcStore {
    pub fn new(client: Arc<RpcClient>, ns: KeyNamespace, enable_cache: bool) -> Self {
        let cache: Arc<DashMap<String, CacheEntry>> = Arc::new(DashMap::new());
        if enable_cache {
            let cache = cache.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(CACHE_SWEEP);
                loop {
                    tick.tick().await;
                    let now = Instant::now();
                    cache.retain(|_, entry| entry.expires_at > now);
                }
            });
        }
        Self { client, ns, cache, enable_cache }
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    fn cache_get(&self, physical: &str) -> Option<String> {
        if !self.enable_cache {
            return None;
        }
        let entry = self.cache.get(physical)?;
        (entry.expires_at > Instant::now()).then(|| entry.value.clone())
    }

    fn cache_put(&self, physical: String, value: String) {
        if self.enable_cache {
            self.cache
                .insert(physical, CacheEntry { value, expires_at: Instant::now() + CACHE_TTL });
        }
    }

    fn cache_evict(&self, physical: &str) {
        self.cache.remove(physical);
    }

    /// Evicts every reported key locally and forwards it to the
    /// registered hooks.
    pub fn process_keyspace_changes(&self, keys: &[String], hooks: &[InvalidationHook]) {
        for key in keys {
            info!(key = %key, "evicting key reported by keyspace update");
            self.cache_evict(&self.ns.render(key));
            for hook in hooks {
                hook(key);
            }
        }
    }

    /// Remaining TTL of a key, in seconds.
    pub async fn get_exp(&self, key: &str) -> Result<i64, StorageError> {
        let result = self.client.call("GetExp", json!(self.ns.render(key))).await?;
        Ok(result.as_i64().unwrap_or(0))
    }

    pub async fn get_key_space_update(&self, org_id: &str) -> Result<Vec<String>, StorageError> {
        let result = self.client.call("GetKeySpaceUpdate", json!(org_id)).await?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    pub async fn get_api_definitions(
        &self,
        org_id: &str,
        tags: &[String],
    ) -> Result<String, StorageError> {
        let result = self
            .client
            .call("GetApiDefinitions", json!({"OrgId": org_id, "Tags": tags}))
            .await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    pub async fn get_policies(&self, org_id: &str) -> Result<String, StorageError> {
        let result = self.client.call("GetPolicies", json!(org_id)).await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    pub async fn check_reload(&self, org_id: &str) -> Result<bool, StorageError> {
        let result = self.client.call("CheckReload", json!(org_id)).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Background keyspace-invalidation poller.
    pub fn spawn_keyspace_poller(
        self: &Arc<Self>,
        org_id: String,
        hooks: Vec<InvalidationHook>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            info!(org = %org_id, "keyspace poller started");
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                match store.get_key_space_update(&org_id).await {
                    Ok(keys) if !keys.is_empty() => {
                        info!(count = keys.len(), "keyspace changes detected");
                        store.process_keyspace_changes(&keys, &hooks);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "keyspace poll failed"),
                }
            }
        })
    }

    /// Background reload long-poll; a `true` reply fires the reload
    /// channel and the server rebuilds its spec table.
    pub fn spawn_reload_poller(
        self: &Arc<Self>,
        org_id: String,
        reload: broadcast::Sender<()>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                match store.check_reload(&org_id).await {
                    Ok(true) => {
                        warn!(org = %org_id, "reload instruction received");
                        let _ = reload.send(());
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "reload poll failed"),
                }
            }
        })
    }
}

#[async_trait]
impl KeyStore for RpcStore {
    async fn get(&self, key: &str) -> Result<String, StorageError> {
        let physical = self.ns.render(key);
        if let Some(cached) = self.cache_get(&physical) {
            return Ok(cached);
        }

        match self.client.call("GetKey", json!(physical)).await {
            Ok(result) => {
                let value = result.as_str().unwrap_or_default().to_string();
                self.cache_put(physical, value.clone());
                Ok(value)
            }
            // The remote answers an application error for missing keys.
            Err(RpcError::Remote(_)) => Err(StorageError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), StorageError> {
        let physical = self.ns.render(key);
        let params = InboundData {
            key_name: physical.clone(),
            session_state: value.to_string(),
            timeout: ttl_seconds,
            ..InboundData::default()
        };
        self.client.call("SetKey", json!(params)).await?;
        self.cache_evict(&physical);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let physical = self.ns.render(key);
        let result = self.client.call("DeleteKey", json!(physical)).await?;
        self.cache_evict(&physical);
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<bool, StorageError> {
        if keys.is_empty() {
            return Ok(true);
        }
        let physical: Vec<String> = keys.iter().map(|k| self.ns.render(k)).collect();
        let result = self.client.call("DeleteKeys", json!(physical)).await?;
        for key in &physical {
            self.cache_evict(key);
        }
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<bool, StorageError> {
        warn!("delete_prefix is not part of the RPC surface");
        Ok(false)
    }

    async fn keys(&self, _filter: &str) -> Result<Vec<String>, StorageError> {
        warn!("key listing is not part of the RPC surface");
        Ok(Vec::new())
    }

    async fn increment_with_expire(
        &self,
        key: &str,
        ttl_seconds: i64,
    ) -> Result<i64, StorageError> {
        let params = InboundData {
            key_name: self.ns.render(key),
            expire: ttl_seconds,
            ..InboundData::default()
        };
        // Method name is the wire contract, typo included.
        let result = self.client.call("IncrememntWithExpire", json!(params)).await?;
        Ok(result.as_i64().unwrap_or(0))
    }

    async fn append_to_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let params = InboundData {
            key_name: self.ns.render(key),
            value: value.to_string(),
            ..InboundData::default()
        };
        self.client.call("AppendToSet", json!(params)).await?;
        Ok(())
    }

    async fn get_and_delete_set(&self, _key: &str) -> Result<Vec<String>, StorageError> {
        warn!("set draining is not part of the RPC surface; run the purger against the local store");
        Ok(Vec::new())
    }

    async fn set_rolling_window(
        &self,
        key: &str,
        per_seconds: i64,
        now_ns: i64,
    ) -> Result<usize, StorageError> {
        let params = InboundData {
            key_name: self.ns.render(key),
            per: per_seconds,
            expire: now_ns,
            ..InboundData::default()
        };
        let result = self.client.call("SetRollingWindow", json!(params)).await?;
        Ok(result.as_u64().unwrap_or(0) as usize)
    }

    async fn publish(&self, _channel: &str, _message: &str) -> Result<(), StorageError> {
        warn!("pub/sub is not part of the RPC surface");
        Ok(())
    }

    async fn subscribe(
        &self,
        _channel: &str,
        _handler: MessageHandler,
    ) -> Result<(), StorageError> {
        warn!("pub/sub is not part of the RPC surface");
        Ok(())
    }
}
