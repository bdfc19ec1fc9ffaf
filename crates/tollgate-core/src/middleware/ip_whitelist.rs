//! Source-address allow-list.

use super::{Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::apispec::ApiSpec;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct IpWhitelist {
    spec: Arc<ApiSpec>,
}

impl IpWhitelist {
    pub fn new(spec: Arc<ApiSpec>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Processor for IpWhitelist {
    fn name(&self) -> &'static str {
        "ip_whitelist"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        _ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        if !self.spec.def.enable_ip_whitelisting || self.spec.def.allowed_ips.is_empty() {
            return Ok(Decision::Continue);
        }

        let Some(ip) = req.client_ip() else {
            return Err(GatewayError::AccessDenied("Access denied"));
        };

        if self.spec.def.allowed_ips.iter().any(|allowed| allowed == &ip) {
            Ok(Decision::Continue)
        } else {
            info!(ip = %ip, api = self.spec.api_id(), "client address not on allow-list");
            Err(GatewayError::AccessDenied("Access denied"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support;
    use http::Method;

    fn spec(allowed: &[&str]) -> Arc<ApiSpec> {
        let ips: Vec<String> = allowed.iter().map(|s| format!("\"{s}\"")).collect();
        let raw = format!(
            r#"{{
                "name": "IP API", "api_id": "1", "org_id": "default",
                "enable_ip_whitelisting": true,
                "allowed_ips": [{}],
                "version_data": {{"not_versioned": true, "versions": {{"Default": {{"name": "Default"}}}}}},
                "proxy": {{"listen_path": "/v1", "target_url": "http://upstream.example/"}}
            }}"#,
            ips.join(",")
        );
        Arc::new(ApiSpec::from_json(&raw).unwrap())
    }

    #[tokio::test]
    async fn allowed_peer_passes() {
        let check = IpWhitelist::new(spec(&["127.0.0.1"]));
        let mut req = test_support::request(Method::GET, "/v1/x");
        let decision = check.process(&mut req, &mut RequestContext::default()).await.unwrap();
        assert_eq!(decision, Decision::Continue);
    }

    #[tokio::test]
    async fn unknown_peer_is_denied() {
        let check = IpWhitelist::new(spec(&["10.9.9.9"]));
        let mut req = test_support::request(Method::GET, "/v1/x");
        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn forwarded_for_takes_precedence() {
        let check = IpWhitelist::new(spec(&["203.0.113.5"]));
        let mut req = test_support::request(Method::GET, "/v1/x");
        req.headers.insert("x-forwarded-for", "203.0.113.5".parse().unwrap());
        let decision = check.process(&mut req, &mut RequestContext::default()).await.unwrap();
        assert_eq!(decision, Decision::Continue);
    }

    #[tokio::test]
    async fn empty_list_disables_the_check() {
        let check = IpWhitelist::new(spec(&[]));
        let mut req = test_support::request(Method::GET, "/v1/x");
        req.peer_ip = None;
        let decision = check.process(&mut req, &mut RequestContext::default()).await.unwrap();
        assert_eq!(decision, Decision::Continue);
    }
}
