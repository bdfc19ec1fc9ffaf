//! Rate-limit and quota admission.
//!
//! Two independent checks run per request, in order: the rolling-window
//! rate limit (enforced in the shared store, correct across gateway
//! nodes) and the quota counter (kept on the session and persisted by
//! the session store). The caller persists the mutated session after a
//! verdict.

use crate::session::SessionState;
use crate::storage::{KeyStore, StorageError};

/// Why a request was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    RateExceeded,
    QuotaExceeded,
}

impl DeclineReason {
    /// Numeric reason carried in logs and events (1 = rate, 2 = quota).
    pub fn code(self) -> u8 {
        match self {
            DeclineReason::RateExceeded => 1,
            DeclineReason::QuotaExceeded => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    Forward,
    Declined(DeclineReason),
}

/// Stateless admission engine; all state lives on the session and in
/// the store.
#[derive(Default)]
pub struct SessionLimiter;

impl SessionLimiter {
    /// Runs both checks against the current wall clock.
    pub async fn forward(
        &self,
        session: &mut SessionState,
        key: &str,
        store: &dyn KeyStore,
    ) -> Result<LimitOutcome, StorageError> {
        let now = chrono::Utc::now();
        let now_ns = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp() * 1_000_000_000);
        self.forward_at(session, key, store, now.timestamp(), now_ns).await
    }

    /// Clock-injected variant used by the admission tests.
    pub async fn forward_at(
        &self,
        session: &mut SessionState,
        key: &str,
        store: &dyn KeyStore,
        now_secs: i64,
        now_ns: i64,
    ) -> Result<LimitOutcome, StorageError> {
        if session.rate > 0.0 && session.per > 0.0 {
            let count = store.set_rolling_window(key, session.per as i64, now_ns).await?;
            // Post-insert cardinality: a request landing exactly on the
            // limit passes, only count > rate fails.
            if count as f64 > session.rate {
                return Ok(LimitOutcome::Declined(DeclineReason::RateExceeded));
            }
        }

        if session.quota_max >= 0 {
            if now_secs >= session.quota_renews {
                session.quota_remaining = session.quota_max;
                session.quota_renews = now_secs + session.quota_renewal_rate;
            }
            // Negative remaining can appear under async-write races and
            // counts as exhausted.
            if session.quota_remaining <= 0 {
                return Ok(LimitOutcome::Declined(DeclineReason::QuotaExceeded));
            }
            session.quota_remaining -= 1;
        }

        Ok(LimitOutcome::Forward)
    }
}
