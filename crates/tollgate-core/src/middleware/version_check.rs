//! Version resolution, version expiry and path policy.
//!
//! Runs after authentication: ignored paths were already short-cut by
//! the path guard, so only the whitelist/blacklist decision (and any
//! configured mock replies) is applied here.

use super::{ChainDeps, Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::{
    apispec::{ApiSpec, PathDecision},
    events::{EventKind, EventMeta},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct VersionCheck {
    spec: Arc<ApiSpec>,
    deps: Arc<ChainDeps>,
}

impl VersionCheck {
    pub fn new(spec: Arc<ApiSpec>, deps: Arc<ChainDeps>) -> Self {
        Self { spec, deps }
    }

    fn fire_version_failure(&self, req: &GatewayRequest, ctx: &RequestContext, message: &str) {
        self.deps.events.fire(
            EventKind::VersionFailure,
            EventMeta {
                message: message.to_string(),
                path: req.path.clone(),
                origin: req.client_ip().unwrap_or_default(),
                key: ctx.auth_key.clone().unwrap_or_default(),
            },
        );
    }
}

#[async_trait]
impl Processor for VersionCheck {
    fn name(&self) -> &'static str {
        "version_check"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let Some(name) = self.spec.requested_version(&req.headers) else {
            self.fire_version_failure(req, ctx, "Version information not found");
            return Err(GatewayError::VersionDenied("Version information not found"));
        };

        let Some(version) = self.spec.version(&name) else {
            info!(version = %name, api = self.spec.api_id(), "unknown version requested");
            self.fire_version_failure(req, ctx, "Version does not exist");
            return Err(GatewayError::VersionDenied("This API version does not seem to exist"));
        };

        if version.expired() {
            info!(version = %name, api = self.spec.api_id(), "expired version requested");
            self.fire_version_failure(req, ctx, "Version has expired");
            return Err(GatewayError::VersionDenied("This API version has expired"));
        }

        ctx.version = Some(name);

        match version.allow_decision(&req.path, req.method.as_str()) {
            PathDecision::Proceed | PathDecision::Ignore => Ok(Decision::Continue),
            PathDecision::Reply(reply) => Ok(Decision::Respond(reply)),
            PathDecision::NotAllowed => {
                Err(GatewayError::AccessDenied("Requested path is not allowed"))
            }
            PathDecision::Forbidden => {
                Err(GatewayError::AccessDenied("Requested path is forbidden"))
            }
        }
    }
}
