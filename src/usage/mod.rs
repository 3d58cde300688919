//! Quota evaluation and metered usage counters.
//!
//! Every evaluation resolves the effective plan first (which applies lazy
//! trial expiry), then reads this month's counters. Increments are atomic
//! insert-or-add writes, safe under parallel requests.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLevel, AuditSink};
use crate::clock::Clock;
use crate::error::Error;
use crate::store::Store;
use crate::subscription::plans::{EffectivePlan, MonthlyLimit};
use crate::subscription::SubscriptionService;

/// One resource dimension: current usage against the effective limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    pub used: i64,
    /// `None` when uncapped; `Some(0)` for monthly dimensions means the
    /// feature is not entitled.
    pub limit: Option<i64>,
    pub unlimited: bool,
}

impl Dimension {
    fn capped(used: i64, limit: i64) -> Self {
        Self {
            used,
            limit: Some(limit),
            unlimited: false,
        }
    }

    fn unlimited(used: i64) -> Self {
        Self {
            used,
            limit: None,
            unlimited: true,
        }
    }

    fn from_monthly(used: i64, limit: MonthlyLimit) -> Self {
        match limit {
            MonthlyLimit::Unlimited => Self::unlimited(used),
            MonthlyLimit::NotEntitled => Self::capped(used, 0),
            MonthlyLimit::Capped(limit) => Self::capped(used, limit),
        }
    }
}

/// Effective limits and usage across every dimension, plus feature flags.
#[derive(Debug, Clone)]
pub struct UsageLimits {
    pub plan_code: String,
    pub domains: Dimension,
    pub team_members: Dimension,
    pub sms: Dimension,
    pub api_requests: Dimension,
    pub email_alerts: bool,
    pub sms_alerts: bool,
    pub slack_alerts: bool,
}

pub struct QuotaEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    subscriptions: Arc<SubscriptionService>,
}

impl QuotaEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        subscriptions: Arc<SubscriptionService>,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            subscriptions,
        }
    }

    /// Compose the effective plan with this month's usage.
    ///
    /// Domain and team counts live with the caller's own data model, so they
    /// are passed in rather than read here.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn limits(
        &self,
        identity_id: Uuid,
        current_domain_count: i64,
        current_team_count: i64,
    ) -> Result<UsageLimits, Error> {
        let effective = self.resolve(identity_id).await?;
        let usage = self
            .store
            .usage_for_month(identity_id, &month_key(self.clock.now()))
            .await?;

        let domains = match effective.domain_limit() {
            None => Dimension::unlimited(current_domain_count),
            Some(limit) => Dimension::capped(current_domain_count, limit),
        };
        let team_members = match effective.team_limit() {
            None => Dimension::unlimited(current_team_count),
            Some(limit) => Dimension::capped(current_team_count, limit),
        };
        Ok(UsageLimits {
            plan_code: effective.plan.code.clone(),
            domains,
            team_members,
            sms: Dimension::from_monthly(usage.sms_sent, effective.sms_limit()),
            api_requests: Dimension::from_monthly(usage.api_requests, effective.api_limit()),
            email_alerts: effective.email_alerts(),
            sms_alerts: effective.sms_alerts(),
            slack_alerts: effective.slack_alerts(),
        })
    }

    /// # Errors
    /// Store failures only.
    pub async fn can_add_domain(&self, identity_id: Uuid, current_count: i64) -> Result<bool, Error> {
        let effective = self.resolve(identity_id).await?;
        Ok(match effective.domain_limit() {
            None => true,
            Some(limit) => current_count < limit,
        })
    }

    /// # Errors
    /// Store failures only.
    pub async fn can_add_team_member(
        &self,
        identity_id: Uuid,
        current_count: i64,
    ) -> Result<bool, Error> {
        let effective = self.resolve(identity_id).await?;
        Ok(match effective.team_limit() {
            None => true,
            Some(limit) => current_count < limit,
        })
    }

    /// # Errors
    /// Store failures only.
    pub async fn can_send_sms(&self, identity_id: Uuid) -> Result<bool, Error> {
        Ok(matches!(
            self.sms_headroom(identity_id).await?,
            Headroom::Unlimited | Headroom::Remaining(1..)
        ))
    }

    /// # Errors
    /// Store failures only.
    pub async fn can_make_api_request(&self, identity_id: Uuid) -> Result<bool, Error> {
        Ok(matches!(
            self.api_headroom(identity_id).await?,
            Headroom::Unlimited | Headroom::Remaining(1..)
        ))
    }

    /// # Errors
    /// Store failures only.
    pub async fn can_use_slack_alerts(&self, identity_id: Uuid) -> Result<bool, Error> {
        let effective = self.resolve(identity_id).await?;
        Ok(effective.slack_alerts())
    }

    /// Typed variant of [`Self::can_add_domain`] for transport layers.
    ///
    /// # Errors
    /// `DomainLimitReached` on denial; store failures otherwise.
    pub async fn check_domain_limit(
        &self,
        identity_id: Uuid,
        current_count: i64,
    ) -> Result<(), Error> {
        if self.can_add_domain(identity_id, current_count).await? {
            Ok(())
        } else {
            Err(self.denied(identity_id, Error::DomainLimitReached))
        }
    }

    /// # Errors
    /// `TeamLimitReached` on denial; store failures otherwise.
    pub async fn check_team_limit(
        &self,
        identity_id: Uuid,
        current_count: i64,
    ) -> Result<(), Error> {
        if self.can_add_team_member(identity_id, current_count).await? {
            Ok(())
        } else {
            Err(self.denied(identity_id, Error::TeamLimitReached))
        }
    }

    /// # Errors
    /// `FeatureNotAvailable` when the plan has no SMS allowance,
    /// `SmsLimitReached` when this month's allowance is spent.
    pub async fn check_sms_limit(&self, identity_id: Uuid) -> Result<(), Error> {
        match self.sms_headroom(identity_id).await? {
            Headroom::Unlimited | Headroom::Remaining(1..) => Ok(()),
            Headroom::NotEntitled => Err(self.denied(identity_id, Error::FeatureNotAvailable)),
            Headroom::Remaining(_) => Err(self.denied(identity_id, Error::SmsLimitReached)),
        }
    }

    /// # Errors
    /// `FeatureNotAvailable` when the plan has no API allowance,
    /// `ApiLimitReached` when this month's allowance is spent.
    pub async fn check_api_limit(&self, identity_id: Uuid) -> Result<(), Error> {
        match self.api_headroom(identity_id).await? {
            Headroom::Unlimited | Headroom::Remaining(1..) => Ok(()),
            Headroom::NotEntitled => Err(self.denied(identity_id, Error::FeatureNotAvailable)),
            Headroom::Remaining(_) => Err(self.denied(identity_id, Error::ApiLimitReached)),
        }
    }

    /// # Errors
    /// `FeatureNotAvailable` when the plan has no Slack alerts.
    pub async fn check_slack_access(&self, identity_id: Uuid) -> Result<(), Error> {
        if self.can_use_slack_alerts(identity_id).await? {
            Ok(())
        } else {
            Err(self.denied(identity_id, Error::FeatureNotAvailable))
        }
    }

    /// Atomic insert-or-add on this month's API counter. Callers meter
    /// successful requests only.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn increment_api_requests(&self, identity_id: Uuid, count: i64) -> Result<(), Error> {
        self.store
            .add_usage(identity_id, &month_key(self.clock.now()), count, 0)
            .await?;
        Ok(())
    }

    /// # Errors
    /// Store failures only.
    pub async fn increment_sms_alerts(&self, identity_id: Uuid, count: i64) -> Result<(), Error> {
        self.store
            .add_usage(identity_id, &month_key(self.clock.now()), 0, count)
            .await?;
        Ok(())
    }

    async fn resolve(&self, identity_id: Uuid) -> Result<EffectivePlan, Error> {
        self.subscriptions.resolve_effective_plan(identity_id).await
    }

    async fn sms_headroom(&self, identity_id: Uuid) -> Result<Headroom, Error> {
        let effective = self.resolve(identity_id).await?;
        match effective.sms_limit() {
            MonthlyLimit::Unlimited => Ok(Headroom::Unlimited),
            MonthlyLimit::NotEntitled => Ok(Headroom::NotEntitled),
            MonthlyLimit::Capped(limit) => {
                let usage = self
                    .store
                    .usage_for_month(identity_id, &month_key(self.clock.now()))
                    .await?;
                Ok(Headroom::Remaining((limit - usage.sms_sent).max(0)))
            }
        }
    }

    async fn api_headroom(&self, identity_id: Uuid) -> Result<Headroom, Error> {
        let effective = self.resolve(identity_id).await?;
        match effective.api_limit() {
            MonthlyLimit::Unlimited => Ok(Headroom::Unlimited),
            MonthlyLimit::NotEntitled => Ok(Headroom::NotEntitled),
            MonthlyLimit::Capped(limit) => {
                let usage = self
                    .store
                    .usage_for_month(identity_id, &month_key(self.clock.now()))
                    .await?;
                Ok(Headroom::Remaining((limit - usage.api_requests).max(0)))
            }
        }
    }

    fn denied(&self, identity_id: Uuid, err: Error) -> Error {
        self.audit.record(
            AuditEntry::new(AuditLevel::Warn, "limit.denied", "entitlement denied")
                .with_identity(identity_id)
                .with_error_code(err.code())
                .with_metadata(json!({ "code": err.code() })),
        );
        err
    }
}

enum Headroom {
    Unlimited,
    NotEntitled,
    Remaining(i64),
}

/// Calendar-month key, e.g. `2026-08`.
fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::{month_key, QuotaEngine};
    use crate::audit::TracingAuditSink;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::error::Error;
    use crate::store::memory::MemStore;
    use crate::subscription::plans::PLAN_ENTERPRISE;
    use crate::subscription::SubscriptionService;
    use crate::store::BillingCycle;
    use chrono::{DateTime, Duration, Utc};
    use secrecy::SecretString;
    use std::sync::Arc;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    async fn engine() -> (QuotaEngine, Arc<SubscriptionService>, ManualClock) {
        let store = Arc::new(MemStore::new());
        let clock = ManualClock::new(start());
        let config = EngineConfig::new(SecretString::from("secret".to_string()));
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(TracingAuditSink),
            &config,
        ));
        subscriptions.seed_default_plans().await.ok();
        let engine = QuotaEngine::new(
            store,
            Arc::new(clock.clone()),
            Arc::new(TracingAuditSink),
            subscriptions.clone(),
        );
        (engine, subscriptions, clock)
    }

    #[test]
    fn month_key_format() {
        let date = DateTime::parse_from_rfc3339("2026-08-06T10:00:00Z")
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(DateTime::UNIX_EPOCH);
        assert_eq!(month_key(date), "2026-08");
    }

    #[tokio::test]
    async fn trial_override_and_base_limit_coincide_at_ten_domains() {
        let (engine, subscriptions, clock) = engine().await;
        let identity_id = Uuid::new_v4();

        // On trial: professional plan, but the override caps domains at 10.
        subscriptions.assign_trial(identity_id).await.ok();
        assert_eq!(engine.can_add_domain(identity_id, 10).await.ok(), Some(false));
        assert_eq!(engine.can_add_domain(identity_id, 9).await.ok(), Some(true));

        // Off trial: the base plan's own 10-domain limit must evaluate the
        // same way on its own.
        clock.advance(Duration::days(15));
        assert_eq!(engine.can_add_domain(identity_id, 10).await.ok(), Some(false));
        assert_eq!(engine.can_add_domain(identity_id, 9).await.ok(), Some(true));
    }

    #[tokio::test]
    async fn sms_not_entitled_on_base_plan() {
        let (engine, subscriptions, _clock) = engine().await;
        let identity_id = Uuid::new_v4();
        subscriptions.assign_default(identity_id).await.ok();

        assert_eq!(engine.can_send_sms(identity_id).await.ok(), Some(false));
        assert!(matches!(
            engine.check_sms_limit(identity_id).await,
            Err(Error::FeatureNotAvailable)
        ));
    }

    #[tokio::test]
    async fn sms_cap_enforced_during_trial() {
        let (engine, subscriptions, _clock) = engine().await;
        let identity_id = Uuid::new_v4();
        subscriptions.assign_trial(identity_id).await.ok();

        assert_eq!(engine.can_send_sms(identity_id).await.ok(), Some(true));
        engine.increment_sms_alerts(identity_id, 10).await.ok();
        assert_eq!(engine.can_send_sms(identity_id).await.ok(), Some(false));
        assert!(matches!(
            engine.check_sms_limit(identity_id).await,
            Err(Error::SmsLimitReached)
        ));
    }

    #[tokio::test]
    async fn api_limit_enforced_monthly() {
        let (engine, subscriptions, clock) = engine().await;
        let identity_id = Uuid::new_v4();
        subscriptions.assign_default(identity_id).await.ok();

        engine.increment_api_requests(identity_id, 10_000).await.ok();
        assert_eq!(
            engine.can_make_api_request(identity_id).await.ok(),
            Some(false)
        );
        assert!(matches!(
            engine.check_api_limit(identity_id).await,
            Err(Error::ApiLimitReached)
        ));

        // Counters are keyed by calendar month; a new month reads as zero.
        clock.advance(Duration::days(32));
        assert_eq!(
            engine.can_make_api_request(identity_id).await.ok(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn unlimited_tier_bypasses_all_checks() {
        let (engine, subscriptions, _clock) = engine().await;
        let identity_id = Uuid::new_v4();
        subscriptions
            .change_plan(identity_id, PLAN_ENTERPRISE, BillingCycle::Yearly, None)
            .await
            .ok();

        engine.increment_api_requests(identity_id, 1_000_000).await.ok();
        assert_eq!(engine.can_add_domain(identity_id, 10_000).await.ok(), Some(true));
        assert_eq!(
            engine.can_add_team_member(identity_id, 10_000).await.ok(),
            Some(true)
        );
        assert_eq!(engine.can_send_sms(identity_id).await.ok(), Some(true));
        assert_eq!(
            engine.can_make_api_request(identity_id).await.ok(),
            Some(true)
        );
        assert_eq!(
            engine.can_use_slack_alerts(identity_id).await.ok(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn limits_compose_plan_and_usage() {
        let (engine, subscriptions, _clock) = engine().await;
        let identity_id = Uuid::new_v4();
        subscriptions.assign_trial(identity_id).await.ok();
        engine.increment_sms_alerts(identity_id, 4).await.ok();
        engine.increment_api_requests(identity_id, 123).await.ok();

        let limits = engine.limits(identity_id, 7, 2).await.ok();
        let limits = limits.expect("limits");
        assert_eq!(limits.plan_code, "professional");
        assert_eq!(limits.domains.used, 7);
        assert_eq!(limits.domains.limit, Some(10));
        assert_eq!(limits.team_members.limit, Some(10));
        assert_eq!(limits.sms.used, 4);
        assert_eq!(limits.sms.limit, Some(10));
        assert_eq!(limits.api_requests.used, 123);
        assert_eq!(limits.api_requests.limit, Some(100_000));
        assert!(limits.slack_alerts);
    }

    #[tokio::test]
    async fn slack_access_denied_on_base_plan() {
        let (engine, subscriptions, _clock) = engine().await;
        let identity_id = Uuid::new_v4();
        subscriptions.assign_default(identity_id).await.ok();

        assert!(matches!(
            engine.check_slack_access(identity_id).await,
            Err(Error::FeatureNotAvailable)
        ));
    }

    #[tokio::test]
    async fn domain_denial_is_typed() {
        let (engine, subscriptions, _clock) = engine().await;
        let identity_id = Uuid::new_v4();
        subscriptions.assign_default(identity_id).await.ok();

        assert!(engine.check_domain_limit(identity_id, 9).await.is_ok());
        assert!(matches!(
            engine.check_domain_limit(identity_id, 10).await,
            Err(Error::DomainLimitReached)
        ));
        assert!(matches!(
            engine.check_team_limit(identity_id, 3).await,
            Err(Error::TeamLimitReached)
        ));
    }
}
