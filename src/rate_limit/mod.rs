//! Per-application rate limiting.
//!
//! Rules are registered per app and compiled once. For each admitted
//! request every rule whose path matches is checked concurrently; the
//! request passes only if all of them pass.
//!
//! ```text
//!              ┌── rule 0: skip? ─► key ─► store.increment ──┐
//! request ─────┼── rule 1: skip? ─► key ─► store.increment ──┼──► all ok ─► pass
//!              └── rule 2: path does not match (not run)     │
//!                                                            └──► first error wins
//! ```
//!
//! A violation is reported as `RateLimited` with the rule's message. A store
//! failure is reported as `LimiterUnavailable`, which is distinct from a
//! violation: the request is failed rather than silently admitted.

mod rule;
mod store;

pub use rule::{
    DEFAULT_MESSAGE, MethodFilter, MethodSpec, RateLimitOptions, RateLimitRule, RuleError,
    RuleInput, StoreKind, Zone,
};
pub use store::{CountingStore, MemoryCountingStore, StoreError};

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use tracing::{error, warn};

use crate::error::{AdmissionError, AdmissionResult};

/// Evaluates an app's rules against one request.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store_timeout: Duration) -> Self {
        Self { store_timeout }
    }

    /// Check every rule matching `path`. Returns the first failure.
    pub async fn check(
        &self,
        rules: &[Arc<RateLimitRule>],
        path: &str,
        input: &RuleInput<'_>,
    ) -> AdmissionResult<()> {
        let checks = rules
            .iter()
            .filter(|rule| rule.matches_path(path))
            .map(|rule| self.check_rule(rule, input));

        try_join_all(checks).await.map(|_| ())
    }

    async fn check_rule(&self, rule: &RateLimitRule, input: &RuleInput<'_>) -> AdmissionResult<()> {
        if rule.should_skip(input) {
            return Ok(());
        }

        let key = rule.key_for(input);
        let hit = rule.store().increment(&key, rule.window(), rule.max());

        match tokio::time::timeout(self.store_timeout, hit).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                warn!(
                    app_id = %input.app_id,
                    rule = %rule.id(),
                    zone = ?rule.zone(),
                    client_ip = %input.ip,
                    "Rate limit exceeded"
                );
                crate::metrics::record_rate_limit_violation(input.app_id);
                Err(AdmissionError::RateLimited(rule.message().to_string()))
            }
            Ok(Err(e)) => {
                error!(app_id = %input.app_id, rule = %rule.id(), error = %e, "Rate limit store failed");
                Err(AdmissionError::LimiterUnavailable(e.to_string()))
            }
            Err(_) => {
                error!(
                    app_id = %input.app_id,
                    rule = %rule.id(),
                    timeout = ?self.store_timeout,
                    "Rate limit store timed out"
                );
                Err(AdmissionError::LimiterUnavailable(format!(
                    "store did not answer within {:?}",
                    self.store_timeout
                )))
            }
        }
    }
}
