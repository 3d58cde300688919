//! Fixed-window rate limiting for security-sensitive token issuance.
//!
//! The whole decision is one atomic check-and-increment against the shared
//! store, so stateless workers cannot jointly exceed the cap.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use crate::audit::{AuditEntry, AuditLevel, AuditSink};
use crate::clock::Clock;
use crate::error::Error;
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub struct FixedWindowLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    cap: i64,
    window: Duration,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        cap: i64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            cap,
            window,
        }
    }

    /// Record an attempt for `key` and decide whether it is allowed.
    ///
    /// # Errors
    /// Only store failures; a denial is a decision, not an error.
    pub async fn check(&self, key: &str) -> Result<RateLimitDecision, Error> {
        let outcome = self
            .store
            .rate_limit_hit(key, self.cap, self.window, self.clock.now())
            .await?;
        if outcome.allowed {
            Ok(RateLimitDecision::Allowed)
        } else {
            self.audit.record(
                AuditEntry::new(AuditLevel::Warn, "rate_limit.denied", "issuance rate limited")
                    .with_error_code("RATE_LIMIT_EXCEEDED")
                    .with_metadata(json!({ "key": key, "cap": self.cap })),
            );
            Ok(RateLimitDecision::Limited)
        }
    }

    /// Variant of [`Self::check`] for callers that fail closed on denial.
    ///
    /// # Errors
    /// `RateLimitExceeded` on denial; store failures otherwise.
    pub async fn require(&self, key: &str) -> Result<(), Error> {
        match self.check(key).await? {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited => Err(Error::RateLimitExceeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FixedWindowLimiter, RateLimitDecision};
    use crate::audit::TracingAuditSink;
    use crate::clock::ManualClock;
    use crate::store::memory::MemStore;
    use chrono::{DateTime, Duration};
    use std::sync::Arc;

    fn limiter(clock: &ManualClock) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
            Arc::new(MemStore::new()),
            Arc::new(clock.clone()),
            Arc::new(TracingAuditSink),
            3,
            Duration::hours(1),
        )
    }

    fn start() -> DateTime<chrono::Utc> {
        DateTime::from_timestamp(1_750_000_000, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    #[tokio::test]
    async fn three_allowed_then_denied_within_window() {
        let clock = ManualClock::new(start());
        let limiter = limiter(&clock);

        for _ in 0..3 {
            let decision = limiter.check("user@example.com").await.ok();
            assert_eq!(decision, Some(RateLimitDecision::Allowed));
            clock.advance(Duration::minutes(5));
        }
        let decision = limiter.check("user@example.com").await.ok();
        assert_eq!(decision, Some(RateLimitDecision::Limited));
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let clock = ManualClock::new(start());
        let limiter = limiter(&clock);

        for _ in 0..3 {
            let _ = limiter.check("user@example.com").await;
        }
        assert_eq!(
            limiter.check("user@example.com").await.ok(),
            Some(RateLimitDecision::Limited)
        );

        clock.advance(Duration::hours(1) + Duration::seconds(1));
        assert_eq!(
            limiter.check("user@example.com").await.ok(),
            Some(RateLimitDecision::Allowed)
        );
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let clock = ManualClock::new(start());
        let limiter = limiter(&clock);

        for _ in 0..3 {
            let _ = limiter.check("a@example.com").await;
        }
        assert_eq!(
            limiter.check("a@example.com").await.ok(),
            Some(RateLimitDecision::Limited)
        );
        assert_eq!(
            limiter.check("b@example.com").await.ok(),
            Some(RateLimitDecision::Allowed)
        );
    }

    #[tokio::test]
    async fn require_fails_closed_on_denial() {
        let clock = ManualClock::new(start());
        let limiter = limiter(&clock);

        for _ in 0..3 {
            assert!(limiter.require("user@example.com").await.is_ok());
        }
        assert!(matches!(
            limiter.require("user@example.com").await,
            Err(crate::error::Error::RateLimitExceeded)
        ));
    }
}
