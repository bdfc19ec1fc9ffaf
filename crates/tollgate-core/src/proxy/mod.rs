//! Upstream forwarder.
//!
//! One single-host reverse proxy per API spec. The request that
//! survived the chain is rewritten (listen-path strip, hop-by-hop
//! header removal, `X-Forwarded-For`) and sent upstream single-shot;
//! the response streams back to the caller. Success and failure both
//! feed the analytics queue; the health counters advance only on
//! admission failures, never here.

use crate::{
    analytics::{hash_key, AnalyticsRecord, AnalyticsRecorder},
    apispec::ApiSpec,
    middleware::{GatewayError, GatewayRequest, RequestContext},
};
use http::{HeaderMap, StatusCode};
use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};

/// Headers that must not cross the proxy boundary in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub struct ReverseProxy {
    client: reqwest::Client,
    target: url::Url,
    listen_path: String,
    strip_listen_path: bool,
    preserve_host: bool,
    api_id: String,
    org_id: String,
    analytics: Arc<AnalyticsRecorder>,
}

/// The upstream reply, headers cleaned; the body is still streaming.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub upstream: reqwest::Response,
}

impl ReverseProxy {
    pub fn for_spec(
        spec: &ApiSpec,
        client: reqwest::Client,
        analytics: Arc<AnalyticsRecorder>,
    ) -> Result<Self, GatewayError> {
        let target = url::Url::parse(&spec.def.proxy.target_url).map_err(|e| {
            warn!(api = spec.api_id(), target = %spec.def.proxy.target_url, error = %e,
                "unparseable target URL");
            GatewayError::Internal
        })?;
        Ok(Self {
            client,
            target,
            listen_path: spec.def.proxy.listen_path.clone(),
            strip_listen_path: spec.def.proxy.strip_listen_path,
            preserve_host: spec.def.proxy.preserve_host_header,
            api_id: spec.def.api_id.clone(),
            org_id: spec.def.org_id.clone(),
            analytics,
        })
    }

    fn upstream_url(&self, req: &GatewayRequest) -> url::Url {
        let mut path = req.path.as_str();
        if self.strip_listen_path {
            path = path.strip_prefix(self.listen_path.as_str()).unwrap_or(path);
        }
        let joined = format!(
            "{}/{}",
            self.target.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let mut url = self.target.clone();
        url.set_path(&joined);
        url.set_query(req.query.as_deref().filter(|q| !q.is_empty()));
        url
    }

    fn forward_headers(&self, req: &GatewayRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &req.headers {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if name == http::header::HOST && !self.preserve_host {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        // Chain our peer onto X-Forwarded-For.
        if let Some(peer) = req.peer_ip {
            let forwarded = match req.header("x-forwarded-for") {
                Some(existing) => format!("{existing}, {peer}"),
                None => peer.to_string(),
            };
            if let Ok(value) = forwarded.parse() {
                headers.insert("x-forwarded-for", value);
            }
        }
        headers
    }

    fn record(&self, req: &GatewayRequest, ctx: &RequestContext, status: u16, started: Instant) {
        let record = AnalyticsRecord {
            method: req.method.to_string(),
            path: req.path.clone(),
            response_code: status,
            latency_ms: started.elapsed().as_millis() as i64,
            key_hash: ctx.auth_key.as_deref().map(hash_key).unwrap_or_default(),
            api_id: self.api_id.clone(),
            org_id: self.org_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.analytics.record(record, req.client_ip().as_deref());
    }

    /// Forwards the request upstream. Single-shot: a transport failure
    /// is surfaced as a 502 to the client, never retried.
    pub async fn forward(
        &self,
        req: &GatewayRequest,
        ctx: &RequestContext,
    ) -> Result<ProxiedResponse, GatewayError> {
        let url = self.upstream_url(req);
        let started = Instant::now();

        debug!(api = %self.api_id, upstream = %url, method = %req.method, "forwarding");

        let result = self
            .client
            .request(req.method.clone(), url.clone())
            .headers(self.forward_headers(req))
            .body(req.body.clone())
            .send()
            .await;

        let upstream = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(api = %self.api_id, upstream = %url, error = %e, "upstream request failed");
                self.record(req, ctx, StatusCode::BAD_GATEWAY.as_u16(), started);
                return Err(GatewayError::Upstream);
            }
        };

        let status = upstream.status();
        let mut headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        self.record(req, ctx, status.as_u16(), started);

        Ok(ProxiedResponse { status, headers, upstream })
    }
}
