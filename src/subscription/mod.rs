//! Subscription and trial state machine.
//!
//! One row per identity. Assignment upserts the row wholesale; trial expiry is
//! applied lazily through a conditional full-row rewrite at the start of every
//! entitlement query. There is no background sweep: an identity that never
//! queries after its trial ends stays nominally `trial` in storage until the
//! next query downgrades it.

pub mod plans;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLevel, AuditSink};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::store::{
    BillingCycle, PlanRecord, Store, SubscriptionRecord, SubscriptionStatus,
};

use plans::{EffectivePlan, PlanSource, PLAN_FREE, PLAN_PROFESSIONAL};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Pure read of an identity's trial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialInfo {
    pub is_on_trial: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Ceiling of remaining whole days; zero once expired.
    pub days_remaining: i64,
    pub is_expired: bool,
}

impl TrialInfo {
    fn none() -> Self {
        Self {
            is_on_trial: false,
            trial_ends_at: None,
            days_remaining: 0,
            is_expired: false,
        }
    }
}

pub struct SubscriptionService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    trial_length: Duration,
    trial_domain_cap: i64,
    trial_sms_cap: i64,
}

impl SubscriptionService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            trial_length: Duration::days(config.trial_days()),
            trial_domain_cap: config.trial_domain_cap(),
            trial_sms_cap: config.trial_sms_cap(),
        }
    }

    /// Seed the plan catalog reference data.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn seed_default_plans(&self) -> Result<(), Error> {
        self.store.seed_plans(&plans::default_catalog()).await?;
        Ok(())
    }

    /// Put the identity on the base plan, status `active`.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn assign_default(&self, identity_id: Uuid) -> Result<(), Error> {
        let now = self.clock.now();
        self.store
            .upsert_subscription(SubscriptionRecord {
                identity_id,
                plan_code: PLAN_FREE.to_string(),
                status: SubscriptionStatus::Active,
                is_trial: false,
                trial_ends_at: None,
                billing_cycle: BillingCycle::Monthly,
                external_ref: None,
                updated_at: now,
            })
            .await?;
        self.audit.record(
            AuditEntry::new(
                AuditLevel::Info,
                "subscription.assigned",
                "base plan assigned",
            )
            .with_identity(identity_id)
            .with_metadata(json!({ "plan": PLAN_FREE })),
        );
        Ok(())
    }

    /// Start a trial on the mid tier; falls back to the base plan when the mid
    /// tier is missing from reference data.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn assign_trial(&self, identity_id: Uuid) -> Result<(), Error> {
        if self.store.plan_by_code(PLAN_PROFESSIONAL).await?.is_none() {
            return self.assign_default(identity_id).await;
        }
        let now = self.clock.now();
        let trial_ends_at = now + self.trial_length;
        self.store
            .upsert_subscription(SubscriptionRecord {
                identity_id,
                plan_code: PLAN_PROFESSIONAL.to_string(),
                status: SubscriptionStatus::Trial,
                is_trial: true,
                trial_ends_at: Some(trial_ends_at),
                billing_cycle: BillingCycle::Monthly,
                external_ref: None,
                updated_at: now,
            })
            .await?;
        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "trial.assigned", "trial started")
                .with_identity(identity_id)
                .with_metadata(json!({
                    "plan": PLAN_PROFESSIONAL,
                    "trial_ends_at": trial_ends_at.to_rfc3339(),
                })),
        );
        Ok(())
    }

    /// Pure read of the trial state; never writes.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn trial_info(&self, identity_id: Uuid) -> Result<TrialInfo, Error> {
        let Some(subscription) = self.store.subscription_by_identity(identity_id).await? else {
            return Ok(TrialInfo::none());
        };
        match (subscription.is_trial, subscription.trial_ends_at) {
            (true, Some(trial_ends_at)) => {
                let now = self.clock.now();
                let is_expired = now > trial_ends_at;
                let days_remaining = if is_expired {
                    0
                } else {
                    ceil_days(trial_ends_at - now)
                };
                Ok(TrialInfo {
                    is_on_trial: !is_expired,
                    trial_ends_at: Some(trial_ends_at),
                    days_remaining,
                    is_expired,
                })
            }
            _ => Ok(TrialInfo::none()),
        }
    }

    /// Downgrade an expired trial to the base plan. Invoked lazily at the
    /// start of every entitlement query; a no-op for anything but an expired
    /// trial row. Returns whether a downgrade happened.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn check_and_handle_expiration(&self, identity_id: Uuid) -> Result<bool, Error> {
        let downgraded = self
            .store
            .downgrade_expired_trial(identity_id, PLAN_FREE, self.clock.now())
            .await?;
        if downgraded {
            self.audit.record(
                AuditEntry::new(
                    AuditLevel::Info,
                    "trial.expired",
                    "trial expired, downgraded to base plan",
                )
                .with_identity(identity_id)
                .with_metadata(json!({ "plan": PLAN_FREE })),
            );
        }
        Ok(downgraded)
    }

    /// Move the identity onto `plan_code`, status `active`.
    ///
    /// # Errors
    /// `Validation` for an unknown plan code; store failures otherwise.
    pub async fn change_plan(
        &self,
        identity_id: Uuid,
        plan_code: &str,
        billing_cycle: BillingCycle,
        external_ref: Option<String>,
    ) -> Result<(), Error> {
        let Some(plan) = self.store.plan_by_code(plan_code).await? else {
            return Err(Error::Validation(format!("unknown plan: {plan_code}")));
        };
        self.store
            .upsert_subscription(SubscriptionRecord {
                identity_id,
                plan_code: plan.code.clone(),
                status: SubscriptionStatus::Active,
                is_trial: false,
                trial_ends_at: None,
                billing_cycle,
                external_ref,
                updated_at: self.clock.now(),
            })
            .await?;
        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "subscription.changed", "plan changed")
                .with_identity(identity_id)
                .with_metadata(json!({ "plan": plan.code })),
        );
        Ok(())
    }

    /// Cancel the subscription; only rows currently `active` are affected.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn cancel(&self, identity_id: Uuid) -> Result<bool, Error> {
        let cancelled = self
            .store
            .cancel_active_subscription(identity_id, self.clock.now())
            .await?;
        if cancelled {
            self.audit.record(
                AuditEntry::new(
                    AuditLevel::Info,
                    "subscription.cancelled",
                    "subscription cancelled",
                )
                .with_identity(identity_id),
            );
        }
        Ok(cancelled)
    }

    /// Resolve the plan limits applicable right now. This is the single
    /// fallback path every entitlement caller uses: lazy expiry first, then
    /// the subscription row, then the base plan when the row or its plan is
    /// missing.
    ///
    /// # Errors
    /// Store failures; a missing base plan is fatal (reference data not
    /// seeded).
    pub async fn resolve_effective_plan(&self, identity_id: Uuid) -> Result<EffectivePlan, Error> {
        self.check_and_handle_expiration(identity_id).await?;

        let Some(subscription) = self.store.subscription_by_identity(identity_id).await? else {
            return Ok(EffectivePlan {
                plan: self.base_plan().await?,
                source: PlanSource::Base,
            });
        };
        let plan = match self.store.plan_by_code(&subscription.plan_code).await? {
            Some(plan) => plan,
            None => self.base_plan().await?,
        };
        let now = self.clock.now();
        let on_trial = subscription.is_trial
            && subscription.status == SubscriptionStatus::Trial
            && subscription.trial_ends_at.is_some_and(|ends| ends >= now);
        let source = if on_trial {
            PlanSource::TrialOverride {
                domain_cap: self.trial_domain_cap,
                sms_cap: self.trial_sms_cap,
            }
        } else {
            PlanSource::Base
        };
        Ok(EffectivePlan { plan, source })
    }

    async fn base_plan(&self) -> Result<PlanRecord, Error> {
        self.store
            .plan_by_code(PLAN_FREE)
            .await?
            .ok_or_else(|| Error::Store(anyhow!("base plan missing from reference data")))
    }
}

fn ceil_days(delta: Duration) -> i64 {
    let seconds = delta.num_seconds().max(0);
    (seconds as u64).div_ceil(SECONDS_PER_DAY as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::plans::{MonthlyLimit, PlanSource, PLAN_FREE, PLAN_PROFESSIONAL};
    use super::{ceil_days, SubscriptionService};
    use crate::audit::TracingAuditSink;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::store::{memory::MemStore, BillingCycle, Store, SubscriptionStatus};
    use chrono::{DateTime, Duration, Utc};
    use secrecy::SecretString;
    use std::sync::Arc;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    async fn service() -> (SubscriptionService, Arc<MemStore>, ManualClock) {
        let store = Arc::new(MemStore::new());
        let clock = ManualClock::new(start());
        let config = EngineConfig::new(SecretString::from("secret".to_string()));
        let service = SubscriptionService::new(
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(TracingAuditSink),
            &config,
        );
        service.seed_default_plans().await.ok();
        (service, store, clock)
    }

    #[test]
    fn ceil_days_rounds_up_partial_days() {
        assert_eq!(ceil_days(Duration::days(7)), 7);
        assert_eq!(ceil_days(Duration::days(6) + Duration::hours(1)), 7);
        assert_eq!(ceil_days(Duration::seconds(1)), 1);
        assert_eq!(ceil_days(Duration::zero()), 0);
        assert_eq!(ceil_days(Duration::days(-1)), 0);
    }

    #[tokio::test]
    async fn repeated_assignment_keeps_one_row() {
        let (service, store, _clock) = service().await;
        let identity_id = Uuid::new_v4();

        assert!(service.assign_default(identity_id).await.is_ok());
        assert!(service.assign_trial(identity_id).await.is_ok());
        assert!(service
            .change_plan(identity_id, PLAN_FREE, BillingCycle::Monthly, None)
            .await
            .is_ok());

        // Upserts mutate the one row; the last write wins.
        let subscription = store
            .subscription_by_identity(identity_id)
            .await
            .ok()
            .flatten();
        assert_eq!(
            subscription.as_ref().map(|s| s.plan_code.as_str()),
            Some(PLAN_FREE)
        );
        assert_eq!(
            subscription.map(|s| s.status),
            Some(SubscriptionStatus::Active)
        );
    }

    #[tokio::test]
    async fn trial_window_math() {
        let (service, _store, clock) = service().await;
        let identity_id = Uuid::new_v4();

        assert!(service.assign_trial(identity_id).await.is_ok());
        let info = service.trial_info(identity_id).await.ok();
        let trial_ends_at = info.and_then(|i| i.trial_ends_at);
        assert!(trial_ends_at > Some(start() + Duration::days(13)));
        assert!(trial_ends_at < Some(start() + Duration::days(15)));

        clock.advance(Duration::days(7));
        let info = service.trial_info(identity_id).await.ok();
        assert_eq!(info.map(|i| (i.is_on_trial, i.is_expired)), Some((true, false)));
        let days = info.map(|i| i.days_remaining).unwrap_or_default();
        assert!(days > 0 && days <= 14);

        clock.advance(Duration::days(8));
        let info = service.trial_info(identity_id).await.ok();
        assert_eq!(
            info.map(|i| (i.is_on_trial, i.is_expired, i.days_remaining)),
            Some((false, true, 0))
        );
    }

    #[tokio::test]
    async fn trial_falls_back_to_default_without_mid_plan() {
        let store = Arc::new(MemStore::new());
        let clock = ManualClock::new(start());
        let config = EngineConfig::new(SecretString::from("secret".to_string()));
        let service = SubscriptionService::new(
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(TracingAuditSink),
            &config,
        );
        // Seed only the base plan.
        let base = super::plans::default_catalog()
            .into_iter()
            .filter(|plan| plan.code == PLAN_FREE)
            .collect::<Vec<_>>();
        store.seed_plans(&base).await.ok();

        let identity_id = Uuid::new_v4();
        assert!(service.assign_trial(identity_id).await.is_ok());

        let subscription = store
            .subscription_by_identity(identity_id)
            .await
            .ok()
            .flatten();
        assert_eq!(
            subscription.as_ref().map(|s| s.plan_code.as_str()),
            Some(PLAN_FREE)
        );
        assert_eq!(subscription.map(|s| s.is_trial), Some(false));
    }

    #[tokio::test]
    async fn expiration_downgrades_lazily() {
        let (service, _store, clock) = service().await;
        let identity_id = Uuid::new_v4();

        assert!(service.assign_trial(identity_id).await.is_ok());
        assert_eq!(
            service.check_and_handle_expiration(identity_id).await.ok(),
            Some(false)
        );

        clock.advance(Duration::days(15));
        assert_eq!(
            service.check_and_handle_expiration(identity_id).await.ok(),
            Some(true)
        );
        assert_eq!(
            service.check_and_handle_expiration(identity_id).await.ok(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn effective_plan_reflects_trial_then_base() {
        let (service, _store, clock) = service().await;
        let identity_id = Uuid::new_v4();

        assert!(service.assign_trial(identity_id).await.is_ok());
        let effective = service.resolve_effective_plan(identity_id).await.ok();
        assert_eq!(
            effective.as_ref().map(|e| e.plan.code.as_str()),
            Some(PLAN_PROFESSIONAL)
        );
        assert!(matches!(
            effective.map(|e| e.source),
            Some(PlanSource::TrialOverride {
                domain_cap: 10,
                sms_cap: 10
            })
        ));

        clock.advance(Duration::days(15));
        let effective = service.resolve_effective_plan(identity_id).await.ok();
        assert_eq!(
            effective.as_ref().map(|e| e.plan.code.as_str()),
            Some(PLAN_FREE)
        );
        assert!(matches!(
            effective.as_ref().map(|e| e.source),
            Some(PlanSource::Base)
        ));
        assert_eq!(
            effective.map(|e| e.sms_limit()),
            Some(MonthlyLimit::NotEntitled)
        );
    }

    #[tokio::test]
    async fn no_subscription_resolves_to_base_plan_without_writing() {
        let (service, store, _clock) = service().await;
        let identity_id = Uuid::new_v4();

        let effective = service.resolve_effective_plan(identity_id).await.ok();
        assert_eq!(
            effective.map(|e| e.plan.code),
            Some(PLAN_FREE.to_string())
        );
        let row = store
            .subscription_by_identity(identity_id)
            .await
            .ok()
            .flatten();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn cancel_only_touches_active_rows() {
        let (service, _store, _clock) = service().await;
        let identity_id = Uuid::new_v4();

        assert!(service.assign_trial(identity_id).await.is_ok());
        assert_eq!(service.cancel(identity_id).await.ok(), Some(false));

        assert!(service
            .change_plan(identity_id, PLAN_PROFESSIONAL, BillingCycle::Yearly, None)
            .await
            .is_ok());
        assert_eq!(service.cancel(identity_id).await.ok(), Some(true));
        assert_eq!(service.cancel(identity_id).await.ok(), Some(false));
    }

    #[tokio::test]
    async fn change_plan_rejects_unknown_codes() {
        let (service, _store, _clock) = service().await;
        let result = service
            .change_plan(Uuid::new_v4(), "platinum", BillingCycle::Monthly, None)
            .await;
        assert!(matches!(result, Err(crate::error::Error::Validation(_))));
    }
}
