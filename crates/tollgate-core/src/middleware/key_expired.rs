//! Session expiry check.

use super::{ChainDeps, Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::{
    apispec::ApiSpec,
    events::{EventKind, EventMeta},
    health::HealthMetric,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct KeyExpiredCheck {
    spec: Arc<ApiSpec>,
    deps: Arc<ChainDeps>,
}

impl KeyExpiredCheck {
    pub fn new(spec: Arc<ApiSpec>, deps: Arc<ChainDeps>) -> Self {
        Self { spec, deps }
    }
}

#[async_trait]
impl Processor for KeyExpiredCheck {
    fn name(&self) -> &'static str {
        "key_expired"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let session = ctx.session.as_ref().ok_or(GatewayError::Internal)?;

        if session.expired_at(chrono::Utc::now().timestamp()) {
            let key = ctx.auth_key.clone().unwrap_or_default();
            info!(key = %key, api = self.spec.api_id(), "expired key rejected");
            self.deps.health.report(self.spec.api_id(), HealthMetric::KeyFailure);
            self.deps.events.fire(
                EventKind::KeyExpired,
                EventMeta {
                    message: "Attempted access with expired key".to_string(),
                    path: req.path.clone(),
                    origin: req.client_ip().unwrap_or_default(),
                    key,
                },
            );
            return Err(GatewayError::KeyExpired);
        }

        Ok(Decision::Continue)
    }
}
