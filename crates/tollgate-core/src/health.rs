//! Per-API health counters.
//!
//! Counters are bounded time series kept in the shared store via
//! `increment_with_expire`, so every gateway node contributes to the
//! same view and stale values age out on their own.

use crate::storage::KeyStore;
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthMetric {
    /// A request was declined by the rate limiter.
    Throttle,
    /// A request was declined by the quota counter.
    QuotaViolation,
    /// An authentication failure. The store contract is
    /// increment-only, so a successful request cycle leaves this
    /// counter untouched and the snapshot reads an absent counter as
    /// zero.
    KeyFailure,
}

impl HealthMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthMetric::Throttle => "Throttle",
            HealthMetric::QuotaViolation => "QuotaViolation",
            HealthMetric::KeyFailure => "KeyFailure",
        }
    }

    pub fn all() -> [HealthMetric; 3] {
        [HealthMetric::Throttle, HealthMetric::QuotaViolation, HealthMetric::KeyFailure]
    }
}

pub struct HealthMonitor {
    store: Arc<dyn KeyStore>,
    enabled: bool,
    value_timeout: i64,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn KeyStore>, enabled: bool, value_timeout: i64) -> Self {
        Self { store, enabled, value_timeout }
    }

    fn counter_key(api_id: &str, metric: HealthMetric) -> String {
        format!("{api_id}.{}", metric.as_str())
    }

    /// Fire-and-forget counter bump; failures are logged and swallowed
    /// so health reporting can never fail a request.
    pub fn report(self: &Arc<Self>, api_id: &str, metric: HealthMetric) {
        if !self.enabled {
            return;
        }
        let monitor = self.clone();
        let key = Self::counter_key(api_id, metric);
        tokio::spawn(async move {
            if let Err(e) = monitor.store.increment_with_expire(&key, monitor.value_timeout).await {
                warn!(counter = %key, error = %e, "health counter update failed");
            }
        });
    }

    /// Current counter values for one API, for the control endpoint.
    pub async fn snapshot(&self, api_id: &str) -> HashMap<&'static str, i64> {
        let mut out = HashMap::new();
        for metric in HealthMetric::all() {
            let value = match self.store.get(&Self::counter_key(api_id, metric)).await {
                Ok(raw) => raw.parse().unwrap_or(0),
                Err(_) => 0,
            };
            out.insert(metric.as_str(), value);
        }
        out
    }
}
