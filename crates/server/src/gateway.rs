//! The data plane: axum adapter around the core chain and proxy.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    response::Response,
    routing::get,
    Router,
};
use http::{HeaderName, HeaderValue, StatusCode};
use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};
use tokio::sync::broadcast;
use tollgate_core::{
    analytics::AnalyticsRecorder,
    apispec::{ApiDefinition, ApiSpec, MockReply},
    events::EventDispatcher,
    health::HealthMonitor,
    limiter::SessionLimiter,
    middleware::{Chain, ChainDeps, ChainVerdict, GatewayError, GatewayRequest, RequestContext},
    plugins::ScriptEngine,
    proxy::ReverseProxy,
    session::SessionManager,
};
use tracing::{error, warn};

/// Largest request body the gateway will buffer for the chain.
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// One routed API: the compiled spec, its chain, and its forwarder.
pub struct GatewayApi {
    pub spec: Arc<ApiSpec>,
    pub chain: Chain,
    pub proxy: ReverseProxy,
}

/// Shared services every API's chain is built from.
#[derive(Clone)]
pub struct GatewayServices {
    pub sessions: Arc<SessionManager>,
    pub org_sessions: Arc<SessionManager>,
    pub health: Arc<HealthMonitor>,
    pub analytics: Arc<AnalyticsRecorder>,
    pub client: reqwest::Client,
    pub enforce_org_quotas: bool,
    pub script_engine: Option<Arc<dyn ScriptEngine>>,
}

/// Compiles definitions into routable APIs, longest listen path first.
/// A definition that fails to compile is skipped with a warning rather
/// than taking the whole node down.
pub fn build_apis(defs: Vec<ApiDefinition>, services: &GatewayServices) -> Vec<Arc<GatewayApi>> {
    let mut apis = Vec::with_capacity(defs.len());
    for def in defs {
        let api_id = def.api_id.clone();
        let spec = match ApiSpec::from_definition(def) {
            Ok(spec) => Arc::new(spec),
            Err(e) => {
                warn!(api = %api_id, error = %e, "skipping unloadable API definition");
                continue;
            }
        };
        let proxy = match ReverseProxy::for_spec(
            &spec,
            services.client.clone(),
            services.analytics.clone(),
        ) {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(api = %api_id, error = %e, "skipping API with unusable proxy target");
                continue;
            }
        };
        let events = Arc::new(EventDispatcher::from_table(
            &spec.def.event_handlers,
            services.client.clone(),
        ));
        let deps = Arc::new(ChainDeps {
            sessions: services.sessions.clone(),
            org_sessions: services.org_sessions.clone(),
            limiter: SessionLimiter,
            health: services.health.clone(),
            events,
            enforce_org_quotas: services.enforce_org_quotas,
            script_engine: services.script_engine.clone(),
        });
        let chain = Chain::for_spec(spec.clone(), deps);
        apis.push(Arc::new(GatewayApi { spec, chain, proxy }));
    }
    apis.sort_by(|a, b| b.spec.listen_path().len().cmp(&a.spec.listen_path().len()));
    apis
}

/// Live routing state; the API table is swapped wholesale on reload so
/// readers never block.
pub struct GatewayState {
    apis: RwLock<Arc<Vec<Arc<GatewayApi>>>>,
    pub health: Arc<HealthMonitor>,
    pub secret: String,
    pub reload: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(
        apis: Vec<Arc<GatewayApi>>,
        health: Arc<HealthMonitor>,
        secret: String,
        reload: broadcast::Sender<()>,
    ) -> Self {
        Self { apis: RwLock::new(Arc::new(apis)), health, secret, reload }
    }

    pub fn route(&self, path: &str) -> Option<Arc<GatewayApi>> {
        let apis = self.apis.read().expect("api table lock poisoned").clone();
        apis.iter().find(|api| path.starts_with(api.spec.listen_path())).cloned()
    }

    pub fn swap(&self, apis: Vec<Arc<GatewayApi>>) {
        *self.apis.write().expect("api table lock poisoned") = Arc::new(apis);
    }

    pub fn api_ids(&self) -> Vec<String> {
        let apis = self.apis.read().expect("api table lock poisoned").clone();
        apis.iter().map(|api| api.spec.api_id().to_string()).collect()
    }
}

/// `{"error": "<message>"}` with the given status, the error shape for
/// every denial the gateway produces.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static error response must build")
}

fn mock_response(reply: MockReply) -> Response {
    let status = StatusCode::from_u16(reply.code).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &reply.headers {
        if let (Ok(name), Ok(value)) =
            (name.parse::<HeaderName>(), HeaderValue::from_str(value))
        {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(reply.data)).unwrap_or_else(|e| {
        error!(error = %e, "configured reply failed to build");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "An unexpected error occurred")
    })
}

async fn handle(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let Some(api) = state.route(request.uri().path()) else {
        return error_response(StatusCode::NOT_FOUND, "Not found");
    };

    let (parts, body) = request.into_parts();
    let peer_ip =
        parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0.ip());

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    let mut gateway_request = GatewayRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        peer_ip,
        body,
    };
    let mut ctx = RequestContext::default();

    match api.chain.run(&mut gateway_request, &mut ctx).await {
        Err(e) => error_response(e.status(), &e.to_string()),
        Ok(ChainVerdict::Reply(reply)) => mock_response(reply),
        Ok(ChainVerdict::Forward) => {
            match api.proxy.forward(&gateway_request, &ctx).await {
                Err(e) => error_response(e.status(), &e.to_string()),
                Ok(proxied) => {
                    let mut builder = Response::builder().status(proxied.status);
                    if let Some(headers) = builder.headers_mut() {
                        *headers = proxied.headers;
                    }
                    builder
                        .body(Body::from_stream(proxied.upstream.bytes_stream()))
                        .unwrap_or_else(|e| {
                            error!(error = %e, "upstream response failed to adapt");
                            error_response(
                                StatusCode::BAD_GATEWAY,
                                &GatewayError::Upstream.to_string(),
                            )
                        })
                }
            }
        }
    }
}

/// The full router: control endpoints plus the data-plane fallback.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/tollgate/health", get(crate::control::health))
        .route("/tollgate/reload", get(crate::control::reload))
        .fallback(handle)
        .with_state(state)
}
