//! The per-request middleware chain.
//!
//! A chain is an ordered list of [`Processor`]s composed once per API
//! spec at build time. Each processor inspects (and may mutate) the
//! request and the request-scoped [`RequestContext`]; the first error
//! short-circuits the chain and becomes a `{"error": "..."}` JSON
//! response, a [`Decision::Bypass`] jumps straight to the proxy, and a
//! [`Decision::Respond`] serves a configured mock reply.
//!
//! Canonical order for a header-token spec:
//! path guard (ignored shortcut) → IP whitelist → authenticate →
//! version check → key expiry → access rights → rate and quota →
//! (transforms) → proxy.

pub mod access_rights;
pub mod auth_key;
pub mod hmac;
pub mod ip_whitelist;
pub mod key_expired;
pub mod path_guard;
pub mod rate_quota;
pub mod transform;
pub mod version_check;

use crate::{
    apispec::{ApiSpec, MockReply},
    events::EventDispatcher,
    health::HealthMonitor,
    limiter::SessionLimiter,
    plugins::ScriptEngine,
    session::{SessionManager, SessionState},
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::{net::IpAddr, sync::Arc};
use tracing::debug;

/// Transport-neutral image of the inbound request, owned by the chain.
#[derive(Clone, Debug)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub peer_ip: Option<IpAddr>,
    pub body: Bytes,
}

impl GatewayRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
    }

    /// Client address for logging and allow-lists: the first
    /// `X-Forwarded-For` entry when present, else the peer address.
    pub fn client_ip(&self) -> Option<String> {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return Some(first.to_string());
                }
            }
        }
        self.peer_ip.map(|ip| ip.to_string())
    }
}

/// Values attached by earlier processors for later ones.
#[derive(Default)]
pub struct RequestContext {
    pub session: Option<SessionState>,
    pub auth_key: Option<String>,
    pub version: Option<String>,
}

/// What a processor wants the chain to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Continue,
    /// Skip every remaining check and forward upstream.
    Bypass,
    /// Serve this reply directly, no upstream call.
    Respond(MockReply),
}

/// Errors a processor can short-circuit the chain with. The display
/// string is the client-facing error message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Access denied")]
    AuthMissing,

    #[error("Key not authorised")]
    AuthInvalid,

    /// All signed-request failures are 400s, a deliberate contract
    /// with existing clients.
    #[error("{0}")]
    HmacInvalid(&'static str),

    #[error("Key has expired, please renew")]
    KeyExpired,

    #[error("{0}")]
    VersionDenied(&'static str),

    #[error("{0}")]
    AccessDenied(&'static str),

    #[error("Rate limit exceeded")]
    RateExceeded,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Upstream service unavailable")]
    Upstream,

    #[error("An unexpected error occurred")]
    Internal,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing | GatewayError::KeyExpired => StatusCode::UNAUTHORIZED,
            GatewayError::AuthInvalid
            | GatewayError::VersionDenied(_)
            | GatewayError::AccessDenied(_)
            | GatewayError::QuotaExceeded => StatusCode::FORBIDDEN,
            GatewayError::HmacInvalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream => StatusCode::BAD_GATEWAY,
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError>;
}

/// Everything the processors of one spec share. Built once per spec at
/// chain-build time; the spec itself is passed to each processor
/// separately so there is no back-pointer cycle.
pub struct ChainDeps {
    pub sessions: Arc<SessionManager>,
    pub org_sessions: Arc<SessionManager>,
    pub limiter: SessionLimiter,
    pub health: Arc<HealthMonitor>,
    pub events: Arc<EventDispatcher>,
    pub enforce_org_quotas: bool,
    pub script_engine: Option<Arc<dyn ScriptEngine>>,
}

/// The outcome of a full chain run.
#[derive(Debug, PartialEq, Eq)]
pub enum ChainVerdict {
    Forward,
    Reply(MockReply),
}

pub struct Chain {
    processors: Vec<Box<dyn Processor>>,
}

impl Chain {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// Composes the canonical chain for a spec: the authenticator
    /// family is chosen by the spec (signed requests or header token),
    /// everything else is fixed order.
    pub fn for_spec(spec: Arc<ApiSpec>, deps: Arc<ChainDeps>) -> Self {
        let mut processors: Vec<Box<dyn Processor>> = vec![
            Box::new(path_guard::PathGuard::new(spec.clone())),
            Box::new(ip_whitelist::IpWhitelist::new(spec.clone())),
        ];

        if spec.def.enable_signature_checking {
            processors.push(Box::new(hmac::HmacCheck::new(spec.clone(), deps.clone())));
        } else {
            processors.push(Box::new(auth_key::AuthKeyCheck::new(spec.clone(), deps.clone())));
        }

        processors.push(Box::new(version_check::VersionCheck::new(spec.clone(), deps.clone())));
        processors.push(Box::new(key_expired::KeyExpiredCheck::new(spec.clone(), deps.clone())));
        processors.push(Box::new(access_rights::AccessRightsCheck::new(
            spec.clone(),
            deps.clone(),
        )));
        processors.push(Box::new(rate_quota::RateQuotaCheck::new(spec.clone(), deps.clone())));

        if let Some(engine) = &deps.script_engine {
            for mw in &spec.def.custom_middleware {
                processors.push(Box::new(transform::TransformProcessor::new(
                    engine.clone(),
                    mw.clone(),
                    deps.sessions.clone(),
                )));
            }
        }

        Self::new(processors)
    }

    pub async fn run(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<ChainVerdict, GatewayError> {
        for processor in &self.processors {
            match processor.process(req, ctx).await {
                Ok(Decision::Continue) => {}
                Ok(Decision::Bypass) => {
                    debug!(stage = processor.name(), "chain bypassed");
                    return Ok(ChainVerdict::Forward);
                }
                Ok(Decision::Respond(reply)) => {
                    debug!(stage = processor.name(), "chain served a configured reply");
                    return Ok(ChainVerdict::Reply(reply));
                }
                Err(e) => {
                    debug!(stage = processor.name(), error = %e, status = %e.status(),
                        "chain stopped");
                    return Err(e);
                }
            }
        }
        Ok(ChainVerdict::Forward)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<Decision, GatewayError>);

    #[async_trait]
    impl Processor for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn process(
            &self,
            _req: &mut GatewayRequest,
            _ctx: &mut RequestContext,
        ) -> Result<Decision, GatewayError> {
            match &self.0 {
                Ok(Decision::Continue) => Ok(Decision::Continue),
                Ok(Decision::Bypass) => Ok(Decision::Bypass),
                Ok(Decision::Respond(r)) => Ok(Decision::Respond(r.clone())),
                Err(e) => Err(e.clone()),
            }
        }
    }

    struct Counting(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl Processor for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn process(
            &self,
            _req: &mut GatewayRequest,
            _ctx: &mut RequestContext,
        ) -> Result<Decision, GatewayError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Decision::Continue)
        }
    }

    fn req() -> GatewayRequest {
        test_support::request(Method::GET, "/v1/thing")
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let reached = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let chain = Chain::new(vec![
            Box::new(Fixed(Err(GatewayError::AuthMissing))),
            Box::new(Counting(reached.clone())),
        ]);

        let err = chain.run(&mut req(), &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::AuthMissing);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(reached.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bypass_skips_remaining_processors() {
        let reached = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let chain = Chain::new(vec![
            Box::new(Fixed(Ok(Decision::Bypass))),
            Box::new(Counting(reached.clone())),
        ]);

        let verdict = chain.run(&mut req(), &mut RequestContext::default()).await.unwrap();
        assert_eq!(verdict, ChainVerdict::Forward);
        assert_eq!(reached.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_chain_forwards() {
        let chain = Chain::new(vec![]);
        let verdict = chain.run(&mut req(), &mut RequestContext::default()).await.unwrap();
        assert_eq!(verdict, ChainVerdict::Forward);
    }

    #[test]
    fn error_statuses_match_contract() {
        assert_eq!(GatewayError::AuthMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::AuthInvalid.status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::HmacInvalid("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::KeyExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::VersionDenied("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::AccessDenied("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::RateExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(GatewayError::QuotaExceeded.status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::Upstream.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut request = req();
        request.headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(request.client_ip(), Some("203.0.113.9".to_string()));

        let request = req();
        assert_eq!(request.client_ip(), Some("127.0.0.1".to_string()));
    }

    #[test]
    fn query_params_decode() {
        let mut request = req();
        request.query = Some("authorization=54321&foo=a%20b".to_string());
        assert_eq!(request.query_param("authorization"), Some("54321".to_string()));
        assert_eq!(request.query_param("foo"), Some("a b".to_string()));
        assert_eq!(request.query_param("missing"), None);
    }
}
