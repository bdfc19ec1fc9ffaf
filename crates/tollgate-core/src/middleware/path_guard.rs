//! Ignored-path shortcut, the first chain stage.
//!
//! Ignored paths skip authentication and admission entirely, so this
//! check has to run before the authenticator. Version problems found
//! here are left for the post-auth version check to report.

use super::{Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::apispec::{ApiSpec, PathDecision};
use async_trait::async_trait;
use std::sync::Arc;

pub struct PathGuard {
    spec: Arc<ApiSpec>,
}

impl PathGuard {
    pub fn new(spec: Arc<ApiSpec>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Processor for PathGuard {
    fn name(&self) -> &'static str {
        "path_guard"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        _ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let Some(name) = self.spec.requested_version(&req.headers) else {
            return Ok(Decision::Continue);
        };
        let Some(version) = self.spec.version(&name) else {
            return Ok(Decision::Continue);
        };

        match version.ignored_decision(&req.path, req.method.as_str()) {
            Some(PathDecision::Reply(reply)) => Ok(Decision::Respond(reply)),
            Some(_) => Ok(Decision::Bypass),
            None => Ok(Decision::Continue),
        }
    }
}
