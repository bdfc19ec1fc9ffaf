//! Gateway event bus.
//!
//! Admission failures and breaker trips raise events; each API spec
//! registers an ordered list of handlers per event kind. Dispatch is
//! fire-and-forget on spawned tasks: a slow or failing handler is
//! logged and never affects the request that raised the event.

use crate::apispec::EventHandlerTable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    QuotaExceeded,
    RateLimitExceeded,
    AuthFailure,
    KeyExpired,
    VersionFailure,
    BreakerTriggered,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::QuotaExceeded => "QuotaExceeded",
            EventKind::RateLimitExceeded => "RateLimitExceeded",
            EventKind::AuthFailure => "AuthFailure",
            EventKind::KeyExpired => "KeyExpired",
            EventKind::VersionFailure => "VersionFailure",
            EventKind::BreakerTriggered => "BreakerTriggered",
        }
    }

    fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "QuotaExceeded" => Some(EventKind::QuotaExceeded),
            "RateLimitExceeded" => Some(EventKind::RateLimitExceeded),
            "AuthFailure" => Some(EventKind::AuthFailure),
            "KeyExpired" => Some(EventKind::KeyExpired),
            "VersionFailure" => Some(EventKind::VersionFailure),
            "BreakerTriggered" => Some(EventKind::BreakerTriggered),
            _ => None,
        }
    }
}

/// Context shipped with every event.
#[derive(Clone, Debug, Serialize)]
pub struct EventMeta {
    pub message: String,
    pub path: String,
    pub origin: String,
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("webhook dispatch failed: {0}")]
    Webhook(String),

    #[error("bad handler configuration: {0}")]
    Config(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, kind: EventKind, meta: &EventMeta) -> Result<(), EventError>;
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogHandlerMeta {
    prefix: String,
}

/// Writes one structured log line per event.
pub struct LogHandler {
    prefix: String,
}

#[async_trait]
impl EventHandler for LogHandler {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn handle(&self, kind: EventKind, meta: &EventMeta) -> Result<(), EventError> {
        info!(
            prefix = %self.prefix,
            event = kind.as_str(),
            key = %meta.key,
            path = %meta.path,
            origin = %meta.origin,
            "{}",
            meta.message
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WebhookHandlerMeta {
    method: String,
    target_path: String,
    header_map: HashMap<String, String>,
    event_timeout: u64,
}

impl Default for WebhookHandlerMeta {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            target_path: String::new(),
            header_map: HashMap::new(),
            event_timeout: 10,
        }
    }
}

/// POSTs the event payload to a configured URL.
pub struct WebhookHandler {
    client: reqwest::Client,
    method: http::Method,
    target: String,
    headers: HashMap<String, String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    #[serde(flatten)]
    meta: &'a EventMeta,
    timestamp: i64,
}

#[async_trait]
impl EventHandler for WebhookHandler {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn handle(&self, kind: EventKind, meta: &EventMeta) -> Result<(), EventError> {
        let payload = WebhookPayload {
            event: kind.as_str(),
            meta,
            timestamp: chrono::Utc::now().timestamp(),
        };
        let mut request = self
            .client
            .request(self.method.clone(), &self.target)
            .timeout(self.timeout)
            .json(&payload);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| EventError::Webhook(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EventError::Webhook(format!(
                "{} answered {}",
                self.target,
                response.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    /// Builds the dispatcher from a spec's handler table. Unknown event
    /// names and handler kinds are skipped with a warning so one bad
    /// entry cannot take the API offline.
    pub fn from_table(table: &EventHandlerTable, client: reqwest::Client) -> Self {
        let mut handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>> = HashMap::new();
        for (event_name, descriptors) in &table.events {
            let Some(kind) = EventKind::from_config_name(event_name) else {
                warn!(event = %event_name, "unknown event kind in handler table");
                continue;
            };
            for descriptor in descriptors {
                let handler: Option<Arc<dyn EventHandler>> = match descriptor.handler_name.as_str()
                {
                    "log" => {
                        let meta: LogHandlerMeta =
                            serde_json::from_value(descriptor.handler_meta.clone())
                                .unwrap_or_default();
                        Some(Arc::new(LogHandler { prefix: meta.prefix }))
                    }
                    "webhook" => {
                        let meta: WebhookHandlerMeta =
                            serde_json::from_value(descriptor.handler_meta.clone())
                                .unwrap_or_default();
                        let method = meta.method.parse().unwrap_or(http::Method::POST);
                        Some(Arc::new(WebhookHandler {
                            client: client.clone(),
                            method,
                            target: meta.target_path,
                            headers: meta.header_map,
                            timeout: Duration::from_secs(meta.event_timeout.max(1)),
                        }))
                    }
                    other => {
                        warn!(handler = %other, event = %event_name, "unknown event handler");
                        None
                    }
                };
                if let Some(handler) = handler {
                    handlers.entry(kind).or_default().push(handler);
                }
            }
        }
        Self { handlers }
    }

    #[cfg(test)]
    pub fn with_handler(kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>> = HashMap::new();
        handlers.insert(kind, vec![handler]);
        Self { handlers }
    }

    /// Dispatches asynchronously to every registered handler.
    pub fn fire(self: &Arc<Self>, kind: EventKind, meta: EventMeta) {
        let Some(registered) = self.handlers.get(&kind) else {
            return;
        };
        for handler in registered {
            let handler = handler.clone();
            let meta = meta.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(kind, &meta).await {
                    warn!(handler = handler.name(), event = kind.as_str(), error = %e,
                        "event handler failed");
                }
            });
        }
    }
}
