//! Interface to the external script engine.
//!
//! User-supplied request mutators run inside a script VM that is not
//! part of this crate. The gateway only depends on the two-call surface
//! below: hand the engine a request and session as JSON, get a mutated
//! request and session metadata back. The side channel
//! ([`GatewaySideApi`]) is what the engine host exposes back to user
//! scripts.

use crate::session::{SessionManager, SessionState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script execution failed: {0}")]
    Execution(String),

    #[error("script returned undecodable data: {0}")]
    BadReturn(String),
}

/// The request image handed to a script, and the shape it hands back.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptRequest {
    pub headers: HashMap<String, Vec<String>>,
    pub set_headers: HashMap<String, String>,
    pub delete_headers: Vec<String>,
    pub body: String,
    pub url: String,
    pub add_params: HashMap<String, String>,
    pub delete_params: Vec<String>,
}

/// What a script run returns: the mutated request plus session
/// metadata to persist.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptOutcome {
    pub request: ScriptRequest,
    pub session_meta: HashMap<String, String>,
}

/// The engine contract: run a named script against a request/session
/// pair, both serialized as JSON, and return the outcome as JSON.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    async fn run(
        &self,
        script_name: &str,
        request_json: &str,
        session_json: &str,
    ) -> Result<String, ScriptError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SideHttpRequest {
    pub method: String,
    pub domain: String,
    pub resource: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub form_data: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SideHttpResponse {
    pub code: u16,
    pub body: String,
    pub headers: HashMap<String, Vec<String>>,
}

/// Helpers the engine host exposes to user scripts.
#[async_trait]
pub trait GatewaySideApi: Send + Sync {
    async fn make_http_request(&self, req: SideHttpRequest) -> Result<SideHttpResponse, ScriptError>;
    async fn get_key_data(&self, key: &str) -> Result<String, ScriptError>;
    async fn set_key_data(&self, key: &str, session_json: &str) -> Result<(), ScriptError>;
}

/// Default side-channel implementation backed by the session store and
/// a plain HTTP client.
pub struct GatewayBridge {
    sessions: Arc<SessionManager>,
    client: reqwest::Client,
}

impl GatewayBridge {
    pub fn new(sessions: Arc<SessionManager>, client: reqwest::Client) -> Self {
        Self { sessions, client }
    }
}

#[async_trait]
impl GatewaySideApi for GatewayBridge {
    async fn make_http_request(
        &self,
        req: SideHttpRequest,
    ) -> Result<SideHttpResponse, ScriptError> {
        let method: http::Method =
            req.method.parse().map_err(|_| ScriptError::Execution("bad method".to_string()))?;
        let url = format!("{}{}", req.domain.trim_end_matches('/'), req.resource);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        builder = if !req.body.is_empty() {
            builder.body(req.body)
        } else if !req.form_data.is_empty() {
            builder.form(&req.form_data)
        } else {
            builder
        };

        let response = builder.send().await.map_err(|e| ScriptError::Execution(e.to_string()))?;
        let code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (k.as_str().to_string(), vec![v.to_str().unwrap_or_default().to_string()])
            })
            .collect();
        let body = response.text().await.map_err(|e| ScriptError::Execution(e.to_string()))?;
        Ok(SideHttpResponse { code, body, headers })
    }

    async fn get_key_data(&self, key: &str) -> Result<String, ScriptError> {
        let session =
            self.sessions.session(key).await.map_err(|e| ScriptError::Execution(e.to_string()))?;
        serde_json::to_string(&session).map_err(|e| ScriptError::Execution(e.to_string()))
    }

    async fn set_key_data(&self, key: &str, session_json: &str) -> Result<(), ScriptError> {
        let session: SessionState =
            serde_json::from_str(session_json).map_err(|e| ScriptError::BadReturn(e.to_string()))?;
        self.sessions
            .update_session(key, &session, 0)
            .await
            .map_err(|e| ScriptError::Execution(e.to_string()))
    }
}
