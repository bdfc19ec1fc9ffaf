//! Rate-limit and quota admission stage.
//!
//! Delegates the decision to the [`SessionLimiter`] and persists the
//! mutated session counters back through the session store in either
//! mode (sync write, or queued when async session writes are on).
//! Storage failures here fail closed.

use super::{ChainDeps, Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::{
    apispec::ApiSpec,
    events::{EventKind, EventMeta},
    health::HealthMetric,
    limiter::{DeclineReason, LimitOutcome},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RateQuotaCheck {
    spec: Arc<ApiSpec>,
    deps: Arc<ChainDeps>,
}

impl RateQuotaCheck {
    pub fn new(spec: Arc<ApiSpec>, deps: Arc<ChainDeps>) -> Self {
        Self { spec, deps }
    }

    fn decline(
        &self,
        req: &GatewayRequest,
        key: &str,
        reason: DeclineReason,
    ) -> GatewayError {
        let (event, metric, message, error) = match reason {
            DeclineReason::RateExceeded => (
                EventKind::RateLimitExceeded,
                HealthMetric::Throttle,
                "Key rate limit exceeded",
                GatewayError::RateExceeded,
            ),
            DeclineReason::QuotaExceeded => (
                EventKind::QuotaExceeded,
                HealthMetric::QuotaViolation,
                "Key quota limit exceeded",
                GatewayError::QuotaExceeded,
            ),
        };
        info!(key = %key, path = %req.path, reason = reason.code(), "{message}");
        self.deps.health.report(self.spec.api_id(), metric);
        self.deps.events.fire(
            event,
            EventMeta {
                message: message.to_string(),
                path: req.path.clone(),
                origin: req.client_ip().unwrap_or_default(),
                key: key.to_string(),
            },
        );
        error
    }

    /// Organisation-wide quota, applied before the key's own counters
    /// when `enforce_org_quotas` is set. Absence of an org record means
    /// no org-level limit.
    async fn check_org_quota(
        &self,
        req: &GatewayRequest,
        org_id: &str,
    ) -> Result<(), GatewayError> {
        let mut org = match self.deps.org_sessions.session(org_id).await {
            Ok(org) => org,
            Err(crate::storage::StorageError::NotFound) => return Ok(()),
            Err(e) => {
                warn!(org = %org_id, error = %e, "org record lookup failed, failing closed");
                return Err(GatewayError::Internal);
            }
        };
        // Org records carry quotas only; their rate fields are unset.
        org.rate = 0.0;

        let outcome = self
            .deps
            .limiter
            .forward(&mut org, org_id, self.deps.org_sessions.store().as_ref())
            .await
            .map_err(|e| {
                warn!(org = %org_id, error = %e, "org quota check failed, failing closed");
                GatewayError::Internal
            })?;

        if let Err(e) = self.deps.org_sessions.update_session(org_id, &org, 0).await {
            warn!(org = %org_id, error = %e, "org record write failed");
        }

        match outcome {
            LimitOutcome::Forward => Ok(()),
            LimitOutcome::Declined(reason) => Err(self.decline(req, org_id, reason)),
        }
    }
}

#[async_trait]
impl Processor for RateQuotaCheck {
    fn name(&self) -> &'static str {
        "rate_quota"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let key = ctx.auth_key.clone().ok_or(GatewayError::Internal)?;
        let session = ctx.session.as_mut().ok_or(GatewayError::Internal)?;

        if self.deps.enforce_org_quotas && !session.org_id.is_empty() {
            let org_id = session.org_id.clone();
            self.check_org_quota(req, &org_id).await?;
        }

        let outcome = self
            .deps
            .limiter
            .forward(session, &key, self.deps.sessions.store().as_ref())
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "admission check failed, failing closed");
                GatewayError::Internal
            })?;

        // Counters are recorded whether or not the request goes
        // through, so a declined request still advances the quota
        // clock on renewal.
        if let Err(e) = self.deps.sessions.update_session(&key, session, 0).await {
            warn!(key = %key, error = %e, "session counter write failed");
            return Err(GatewayError::Internal);
        }

        match outcome {
            LimitOutcome::Forward => Ok(Decision::Continue),
            LimitOutcome::Declined(reason) => Err(self.decline(req, &key, reason)),
        }
    }
}
