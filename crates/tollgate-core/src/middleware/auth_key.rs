//! Header-token authenticator.
//!
//! Pulls the raw key from the configured header (or a query parameter
//! of the same name when `use_param` is set), resolves it to a session
//! and attaches both to the request context for the later stages.

use super::{ChainDeps, Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::{
    apispec::ApiSpec,
    events::{EventKind, EventMeta},
    health::HealthMetric,
    storage::StorageError,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AuthKeyCheck {
    spec: Arc<ApiSpec>,
    deps: Arc<ChainDeps>,
}

impl AuthKeyCheck {
    pub fn new(spec: Arc<ApiSpec>, deps: Arc<ChainDeps>) -> Self {
        Self { spec, deps }
    }

    fn report_failure(&self, req: &GatewayRequest, key: &str, message: &str) {
        self.deps.health.report(self.spec.api_id(), HealthMetric::KeyFailure);
        self.deps.events.fire(
            EventKind::AuthFailure,
            EventMeta {
                message: message.to_string(),
                path: req.path.clone(),
                origin: req.client_ip().unwrap_or_default(),
                key: key.to_string(),
            },
        );
    }
}

#[async_trait]
impl Processor for AuthKeyCheck {
    fn name(&self) -> &'static str {
        "auth_key"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let header_name = self.spec.auth_header_name();
        let mut key = req.header(header_name).unwrap_or_default().to_string();

        if key.is_empty() && self.spec.def.auth.use_param {
            key = req.query_param(header_name).unwrap_or_default();
        }

        if key.is_empty() {
            info!(path = %req.path, api = self.spec.api_id(), "request with no credential");
            self.report_failure(req, "", "Attempted access with no credential");
            return Err(GatewayError::AuthMissing);
        }

        match self.deps.sessions.session(&key).await {
            Ok(session) => {
                ctx.session = Some(session);
                ctx.auth_key = Some(key);
                Ok(Decision::Continue)
            }
            Err(StorageError::NotFound) => {
                info!(path = %req.path, api = self.spec.api_id(), "unknown key rejected");
                self.report_failure(req, &key, "Attempted access with unknown key");
                Err(GatewayError::AuthInvalid)
            }
            Err(e) => {
                warn!(error = %e, "session lookup failed, failing closed");
                Err(GatewayError::Internal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{middleware::test_support, session::SessionState};
    use http::Method;

    const DEF: &str = r#"{
        "name": "Token API", "api_id": "1", "org_id": "default",
        "auth": {"auth_header_name": "authorization", "use_param": true},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}},
        "proxy": {"listen_path": "/v1", "target_url": "http://upstream.example/"}
    }"#;

    fn check(deps: &Arc<ChainDeps>) -> AuthKeyCheck {
        AuthKeyCheck::new(Arc::new(ApiSpec::from_json(DEF).unwrap()), deps.clone())
    }

    #[tokio::test]
    async fn valid_header_token_attaches_session() {
        let deps = test_support::deps();
        deps.sessions.update_session("1234", &SessionState::default(), 60).await.unwrap();

        let mut req = test_support::request(Method::GET, "/v1/x");
        req.headers.insert("authorization", "1234".parse().unwrap());
        let mut ctx = RequestContext::default();

        let decision = check(&deps).process(&mut req, &mut ctx).await.unwrap();
        assert_eq!(decision, Decision::Continue);
        assert!(ctx.session.is_some());
        assert_eq!(ctx.auth_key.as_deref(), Some("1234"));
    }

    #[tokio::test]
    async fn query_param_used_when_configured() {
        let deps = test_support::deps();
        deps.sessions.update_session("54321", &SessionState::default(), 60).await.unwrap();

        let mut req = test_support::request(Method::POST, "/v1/x");
        req.query = Some("authorization=54321".to_string());
        let mut ctx = RequestContext::default();

        let decision = check(&deps).process(&mut req, &mut ctx).await.unwrap();
        assert_eq!(decision, Decision::Continue);
        assert_eq!(ctx.auth_key.as_deref(), Some("54321"));
    }

    #[tokio::test]
    async fn missing_credential_is_401() {
        let deps = test_support::deps();
        let mut req = test_support::request(Method::GET, "/v1/x");
        let err =
            check(&deps).process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::AuthMissing);
        assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "Access denied");
    }

    #[tokio::test]
    async fn unknown_key_is_403() {
        let deps = test_support::deps();
        let mut req = test_support::request(Method::GET, "/v1/x");
        req.headers.insert("authorization", "not-a-key".parse().unwrap());
        let err =
            check(&deps).process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::AuthInvalid);
        assert_eq!(err.to_string(), "Key not authorised");
    }
}
