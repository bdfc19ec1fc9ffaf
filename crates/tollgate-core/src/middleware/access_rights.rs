//! Per-key access rights.
//!
//! A session with a non-empty `access_rights` map may only reach the
//! APIs (and versions) it has grants for. An empty map is a legacy
//! unrestricted key and passes.

use super::{ChainDeps, Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::{
    apispec::ApiSpec,
    events::{EventKind, EventMeta},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct AccessRightsCheck {
    spec: Arc<ApiSpec>,
    deps: Arc<ChainDeps>,
}

impl AccessRightsCheck {
    pub fn new(spec: Arc<ApiSpec>, deps: Arc<ChainDeps>) -> Self {
        Self { spec, deps }
    }
}

#[async_trait]
impl Processor for AccessRightsCheck {
    fn name(&self) -> &'static str {
        "access_rights"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let session = ctx.session.as_ref().ok_or(GatewayError::Internal)?;
        if session.access_rights.is_empty() {
            return Ok(Decision::Continue);
        }

        let key = ctx.auth_key.clone().unwrap_or_default();
        let Some(grant) = session.access_rights.get(self.spec.api_id()) else {
            info!(key = %key, api = self.spec.api_id(), "no grant for this API");
            return Err(GatewayError::AccessDenied("Access to this API has been disallowed"));
        };

        let version = ctx.version.as_deref().unwrap_or_default();
        if !grant.versions.iter().any(|v| v == version) {
            info!(key = %key, api = self.spec.api_id(), version = %version,
                "version not granted to key");
            self.deps.events.fire(
                EventKind::VersionFailure,
                EventMeta {
                    message: "Attempted access to unauthorised version".to_string(),
                    path: req.path.clone(),
                    origin: req.client_ip().unwrap_or_default(),
                    key,
                },
            );
            return Err(GatewayError::AccessDenied(
                "Access to this API version has been disallowed",
            ));
        }

        Ok(Decision::Continue)
    }
}
