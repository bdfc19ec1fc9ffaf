//! Test fixtures: an in-memory gateway and a local echo upstream.

use axum::{
    body::Body,
    extract::Request,
    response::IntoResponse,
    Json, Router,
};
use http::StatusCode;
use serde_json::{json, Value};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::broadcast;
use tollgate_core::{
    analytics::AnalyticsRecorder,
    apispec::ApiDefinition,
    health::HealthMonitor,
    session::{SessionManager, SessionState},
    storage::{memory::MemoryBackend, memory::MemoryStore, KeyNamespace, KeyStore},
};
use tower::ServiceExt;

pub struct TestGateway {
    pub app: Router,
    pub sessions: Arc<SessionManager>,
    pub backend: Arc<MemoryBackend>,
}

/// Builds a routable gateway from raw definition JSON, backed by one
/// shared in-memory store.
pub fn build_gateway(definitions: &[String]) -> TestGateway {
    let backend = Arc::new(MemoryBackend::default());
    let store = |prefix: &str| -> Arc<dyn KeyStore> {
        Arc::new(MemoryStore::new(backend.clone(), KeyNamespace::new(prefix, false)))
    };

    let sessions = Arc::new(SessionManager::new(store("apikey-"), false));
    let services = server::gateway::GatewayServices {
        sessions: sessions.clone(),
        org_sessions: Arc::new(SessionManager::new(store("orgKey."), false)),
        health: Arc::new(HealthMonitor::new(store("apihealth."), true, 60)),
        analytics: Arc::new(AnalyticsRecorder::new(store("analytics-"), true, vec![])),
        client: reqwest::Client::new(),
        enforce_org_quotas: false,
        script_engine: None,
    };

    let defs: Vec<ApiDefinition> = definitions
        .iter()
        .map(|raw| serde_json::from_str(raw).expect("test definition must parse"))
        .collect();

    let (reload_tx, _) = broadcast::channel(1);
    let state = Arc::new(server::gateway::GatewayState::new(
        server::gateway::build_apis(defs, &services),
        services.health.clone(),
        "test-secret".to_string(),
        reload_tx,
    ));

    TestGateway { app: server::gateway::router(state), sessions, backend }
}

/// Spawns an echo upstream that reports back the query arguments, the
/// form fields, the path and the method as JSON.
pub async fn spawn_echo_upstream() -> String {
    async fn echo(request: Request) -> impl IntoResponse {
        let (parts, body) = request.into_parts();

        let args: HashMap<String, String> = parts
            .uri
            .query()
            .map(|q| {
                url_parse(q)
            })
            .unwrap_or_default();

        let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap_or_default();
        let is_form = parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        let form: HashMap<String, String> = if is_form {
            url_parse(&String::from_utf8_lossy(&bytes))
        } else {
            HashMap::new()
        };

        Json(json!({
            "args": args,
            "form": form,
            "path": parts.uri.path(),
            "method": parts.method.as_str(),
        }))
    }

    fn url_parse(raw: &str) -> HashMap<String, String> {
        raw.split('&')
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((
                    k.to_string(),
                    v.replace('+', " ").to_string(),
                ))
            })
            .collect()
    }

    let app = Router::new().fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

/// One request through the gateway router; returns status and body.
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, String) {
    let mut builder = http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
    let request = builder
        .extension(axum::extract::ConnectInfo(peer))
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

pub fn body_json(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or(Value::Null)
}

pub fn throttled_session() -> SessionState {
    SessionState {
        rate: 3.0,
        per: 60.0,
        allowance: 3.0,
        quota_max: -1,
        quota_remaining: 10,
        quota_renewal_rate: 300,
        quota_renews: chrono::Utc::now().timestamp(),
        expires: 0,
        ..SessionState::default()
    }
}

pub fn quota_session() -> SessionState {
    SessionState {
        rate: 0.0,
        per: 0.0,
        quota_max: 2,
        quota_remaining: 2,
        quota_renewal_rate: 300,
        quota_renews: chrono::Utc::now().timestamp() + 300,
        expires: 0,
        ..SessionState::default()
    }
}

pub fn open_session() -> SessionState {
    SessionState {
        rate: 10_000.0,
        per: 60.0,
        quota_max: -1,
        expires: -1,
        ..SessionState::default()
    }
}

pub fn random_key(len: usize) -> String {
    use rand::Rng;
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char).collect()
}
