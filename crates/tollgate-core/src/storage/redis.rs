//! Redis-backed [`KeyStore`].
//!
//! Single-node mode runs over a [`redis::aio::ConnectionManager`]
//! (multiplexed, reconnecting); `enable_cluster` switches to the
//! cluster-aware async connection, which shards keys server-side.
//! Rolling windows and counters use MULTI/EXEC pipelines so the
//! contract's atomicity holds against concurrent gateway nodes.

use super::{KeyNamespace, KeyStore, MessageHandler, StorageError};
use crate::config::StorageConfig;
use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, cluster_async::ClusterConnection, AsyncCommands};
use tracing::{debug, error, warn};

#[derive(Clone)]
enum Backend {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

pub struct RedisStore {
    backend: Backend,
    // Dedicated client for pub/sub; subscriptions need their own
    // connection outside the multiplexed manager.
    pubsub_client: redis::Client,
    ns: KeyNamespace,
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Transport(err.to_string())
    }
}

fn node_url(cfg: &StorageConfig, host: &str, port: u16) -> String {
    let auth = match (cfg.username.as_str(), cfg.password.as_str()) {
        ("", "") => String::new(),
        (user, pass) => format!("{user}:{pass}@"),
    };
    format!("redis://{auth}{host}:{port}/{}", cfg.database)
}

impl RedisStore {
    /// Connects according to the storage section of the gateway config.
    pub async fn connect(cfg: &StorageConfig, ns: KeyNamespace) -> Result<Self, StorageError> {
        let urls: Vec<String> = if cfg.enable_cluster && !cfg.hosts.is_empty() {
            cfg.hosts
                .iter()
                .map(|(host, port)| node_url(cfg, host, port.parse().unwrap_or(6379)))
                .collect()
        } else {
            vec![node_url(cfg, &cfg.host, cfg.port)]
        };

        let pubsub_client = redis::Client::open(urls[0].as_str())?;

        let backend = if cfg.enable_cluster {
            let client = redis::cluster::ClusterClient::new(urls.clone())?;
            Backend::Cluster(client.get_async_connection().await?)
        } else {
            let client = redis::Client::open(urls[0].as_str())?;
            Backend::Single(client.get_connection_manager().await?)
        };

        debug!(nodes = urls.len(), cluster = cfg.enable_cluster, "redis store connected");
        Ok(Self { backend, pubsub_client, ns })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StorageError> {
        match self.backend.clone() {
            Backend::Single(mut conn) => Ok(cmd.query_async(&mut conn).await?),
            Backend::Cluster(mut conn) => Ok(cmd.query_async(&mut conn).await?),
        }
    }

    async fn pipeline<T: redis::FromRedisValue>(
        &self,
        pipe: &redis::Pipeline,
    ) -> Result<T, StorageError> {
        match self.backend.clone() {
            Backend::Single(mut conn) => Ok(pipe.query_async(&mut conn).await?),
            Backend::Cluster(mut conn) => Ok(pipe.query_async(&mut conn).await?),
        }
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn get(&self, key: &str) -> Result<String, StorageError> {
        let value: Option<String> =
            self.query(redis::Cmd::new().arg("GET").arg(self.ns.render(key))).await?;
        value.ok_or(StorageError::NotFound)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), StorageError> {
        let physical = self.ns.render(key);
        let mut cmd = redis::cmd("SET");
        cmd.arg(&physical).arg(value);
        if ttl_seconds > 0 {
            cmd.arg("EX").arg(ttl_seconds);
        }
        self.query::<()>(&cmd).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let removed: i64 =
            self.query(redis::Cmd::new().arg("DEL").arg(self.ns.render(key))).await?;
        Ok(removed > 0)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<bool, StorageError> {
        if keys.is_empty() {
            return Ok(true);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(self.ns.render(key));
        }
        let removed: i64 = self.query(&cmd).await?;
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<bool, StorageError> {
        let pattern = self.ns.render_filter(prefix);
        let keys: Vec<String> = self.query(redis::Cmd::new().arg("KEYS").arg(pattern)).await?;
        if keys.is_empty() {
            return Ok(false);
        }
        let mut cmd = redis::cmd("DEL");
        for key in &keys {
            cmd.arg(key);
        }
        let removed: i64 = self.query(&cmd).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, filter: &str) -> Result<Vec<String>, StorageError> {
        let pattern = self.ns.render_filter(filter);
        let keys: Vec<String> = self.query(redis::Cmd::new().arg("KEYS").arg(pattern)).await?;
        Ok(keys.iter().map(|k| self.ns.strip(k).to_string()).collect())
    }

    async fn increment_with_expire(
        &self,
        key: &str,
        ttl_seconds: i64,
    ) -> Result<i64, StorageError> {
        let physical = self.ns.render(key);
        let value: i64 = self.query(redis::Cmd::new().arg("INCR").arg(&physical)).await?;
        if value == 1 && ttl_seconds > 0 {
            self.query::<i64>(redis::Cmd::new().arg("EXPIRE").arg(&physical).arg(ttl_seconds))
                .await?;
        }
        Ok(value)
    }

    async fn append_to_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.query::<i64>(redis::Cmd::new().arg("RPUSH").arg(self.ns.render(key)).arg(value))
            .await?;
        Ok(())
    }

    async fn get_and_delete_set(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let physical = self.ns.render(key);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LRANGE")
            .arg(&physical)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&physical)
            .ignore();
        let (values,): (Vec<String>,) = self.pipeline(&pipe).await?;
        Ok(values)
    }

    async fn set_rolling_window(
        &self,
        key: &str,
        per_seconds: i64,
        now_ns: i64,
    ) -> Result<usize, StorageError> {
        let physical = self.ns.render(key);
        let horizon = now_ns - per_seconds.saturating_mul(1_000_000_000);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&physical)
            .arg("-inf")
            .arg(horizon)
            .ignore()
            .cmd("ZADD")
            .arg(&physical)
            .arg(now_ns)
            .arg(now_ns)
            .ignore()
            .cmd("ZCARD")
            .arg(&physical)
            .cmd("EXPIRE")
            .arg(&physical)
            .arg(per_seconds)
            .ignore();
        let (count,): (usize,) = self.pipeline(&pipe).await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        let mut conn = self.pubsub_client.get_multiplexed_async_connection().await?;
        let _: i64 = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<(), StorageError> {
        let mut pubsub = self.pubsub_client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => handler(channel.clone(), payload),
                    Err(e) => warn!(channel = %channel, error = %e, "dropping unreadable pub/sub payload"),
                }
            }
            error!(channel = %channel, "pub/sub stream closed");
        });
        Ok(())
    }
}
