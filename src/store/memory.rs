//! In-memory store adapter.
//!
//! Semantics mirror [`super::postgres::PgStore`] statement for statement, so
//! tests and embedders get an isolated store with the same atomicity
//! guarantees (every operation runs under one lock acquisition).

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    IdentityRecord, NewIdentity, PlanRecord, RateLimitOutcome, RateLimitRecord,
    RefreshTokenRecord, Store, StoreError, StoreResult, SubscriptionRecord, SubscriptionStatus,
    UsageRecord,
};

#[derive(Default)]
struct Inner {
    identities: HashMap<Uuid, IdentityRecord>,
    refresh_tokens: HashMap<Vec<u8>, RefreshTokenRecord>,
    rate_limits: HashMap<String, RateLimitRecord>,
    plans: HashMap<String, PlanRecord>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    usage: HashMap<(Uuid, String), UsageRecord>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Io(anyhow!("store mutex poisoned")))
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_identity(&self, identity: NewIdentity) -> StoreResult<IdentityRecord> {
        let mut inner = self.locked()?;
        if inner
            .identities
            .values()
            .any(|existing| existing.email == identity.email)
        {
            return Err(StoreError::Conflict);
        }
        let record = IdentityRecord {
            id: Uuid::new_v4(),
            email: identity.email,
            password_digest: identity.password_digest,
            verified: false,
            verification_digest: None,
            verification_expires_at: None,
            reset_digest: None,
            reset_expires_at: None,
            created_at: identity.created_at,
        };
        inner.identities.insert(record.id, record.clone());
        Ok(record)
    }

    async fn identity_by_id(&self, id: Uuid) -> StoreResult<Option<IdentityRecord>> {
        Ok(self.locked()?.identities.get(&id).cloned())
    }

    async fn identity_by_email(&self, email: &str) -> StoreResult<Option<IdentityRecord>> {
        Ok(self
            .locked()?
            .identities
            .values()
            .find(|identity| identity.email == email)
            .cloned())
    }

    async fn identity_by_verification_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<IdentityRecord>> {
        Ok(self
            .locked()?
            .identities
            .values()
            .find(|identity| identity.verification_digest.as_deref() == Some(digest))
            .cloned())
    }

    async fn identity_by_reset_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<IdentityRecord>> {
        Ok(self
            .locked()?
            .identities
            .values()
            .find(|identity| identity.reset_digest.as_deref() == Some(digest))
            .cloned())
    }

    async fn set_verification_token(
        &self,
        identity_id: Uuid,
        digest: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.locked()?;
        if let Some(identity) = inner.identities.get_mut(&identity_id) {
            identity.verification_digest = Some(digest.to_vec());
            identity.verification_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn mark_verified(&self, identity_id: Uuid) -> StoreResult<()> {
        let mut inner = self.locked()?;
        if let Some(identity) = inner.identities.get_mut(&identity_id) {
            identity.verified = true;
            identity.verification_digest = None;
            identity.verification_expires_at = None;
        }
        Ok(())
    }

    async fn set_reset_token(
        &self,
        identity_id: Uuid,
        digest: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.locked()?;
        if let Some(identity) = inner.identities.get_mut(&identity_id) {
            identity.reset_digest = Some(digest.to_vec());
            identity.reset_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn complete_password_reset(
        &self,
        identity_id: Uuid,
        password_digest: &str,
    ) -> StoreResult<()> {
        let mut inner = self.locked()?;
        if let Some(identity) = inner.identities.get_mut(&identity_id) {
            identity.password_digest = password_digest.to_string();
            identity.reset_digest = None;
            identity.reset_expires_at = None;
        }
        Ok(())
    }

    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> StoreResult<()> {
        let mut inner = self.locked()?;
        if inner.refresh_tokens.contains_key(&record.secret_digest) {
            return Err(StoreError::Conflict);
        }
        inner
            .refresh_tokens
            .insert(record.secret_digest.clone(), record);
        Ok(())
    }

    async fn refresh_token_by_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self.locked()?.refresh_tokens.get(digest).cloned())
    }

    async fn revoke_refresh_token(&self, digest: &[u8]) -> StoreResult<bool> {
        let mut inner = self.locked()?;
        match inner.refresh_tokens.get_mut(digest) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_refresh_tokens(&self, identity_id: Uuid) -> StoreResult<u64> {
        let mut inner = self.locked()?;
        let mut revoked = 0;
        for record in inner.refresh_tokens.values_mut() {
            if record.identity_id == identity_id && !record.revoked {
                record.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn rate_limit_hit(
        &self,
        key: &str,
        cap: i64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitOutcome> {
        let mut inner = self.locked()?;
        let cutoff = now - window;
        match inner.rate_limits.get_mut(key) {
            None => {
                inner.rate_limits.insert(
                    key.to_string(),
                    RateLimitRecord {
                        key: key.to_string(),
                        attempts: 1,
                        window_started_at: now,
                        last_attempt_at: now,
                    },
                );
                Ok(RateLimitOutcome {
                    allowed: true,
                    attempts: 1,
                })
            }
            Some(record) if record.window_started_at < cutoff => {
                record.attempts = 1;
                record.window_started_at = now;
                record.last_attempt_at = now;
                Ok(RateLimitOutcome {
                    allowed: true,
                    attempts: 1,
                })
            }
            Some(record) if record.attempts < cap => {
                record.attempts += 1;
                record.last_attempt_at = now;
                Ok(RateLimitOutcome {
                    allowed: true,
                    attempts: record.attempts,
                })
            }
            Some(_) => Ok(RateLimitOutcome {
                allowed: false,
                attempts: cap,
            }),
        }
    }

    async fn seed_plans(&self, plans: &[PlanRecord]) -> StoreResult<()> {
        let mut inner = self.locked()?;
        for plan in plans {
            inner.plans.insert(plan.code.clone(), plan.clone());
        }
        Ok(())
    }

    async fn plan_by_code(&self, code: &str) -> StoreResult<Option<PlanRecord>> {
        Ok(self.locked()?.plans.get(code).cloned())
    }

    async fn upsert_subscription(&self, record: SubscriptionRecord) -> StoreResult<()> {
        self.locked()?
            .subscriptions
            .insert(record.identity_id, record);
        Ok(())
    }

    async fn subscription_by_identity(
        &self,
        identity_id: Uuid,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        Ok(self.locked()?.subscriptions.get(&identity_id).cloned())
    }

    async fn downgrade_expired_trial(
        &self,
        identity_id: Uuid,
        base_plan_code: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.locked()?;
        match inner.subscriptions.get_mut(&identity_id) {
            Some(subscription)
                if subscription.status == SubscriptionStatus::Trial
                    && subscription.is_trial
                    && subscription.trial_ends_at.is_some_and(|ends| ends < now) =>
            {
                subscription.plan_code = base_plan_code.to_string();
                subscription.status = SubscriptionStatus::Active;
                subscription.is_trial = false;
                subscription.trial_ends_at = None;
                subscription.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_active_subscription(
        &self,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.locked()?;
        match inner.subscriptions.get_mut(&identity_id) {
            Some(subscription) if subscription.status == SubscriptionStatus::Active => {
                subscription.status = SubscriptionStatus::Cancelled;
                subscription.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_usage(
        &self,
        identity_id: Uuid,
        month: &str,
        api_delta: i64,
        sms_delta: i64,
    ) -> StoreResult<()> {
        let mut inner = self.locked()?;
        let counters = inner
            .usage
            .entry((identity_id, month.to_string()))
            .or_default();
        counters.api_requests += api_delta;
        counters.sms_sent += sms_delta;
        Ok(())
    }

    async fn usage_for_month(&self, identity_id: Uuid, month: &str) -> StoreResult<UsageRecord> {
        Ok(self
            .locked()?
            .usage
            .get(&(identity_id, month.to_string()))
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    fn new_identity(email: &str) -> NewIdentity {
        NewIdentity {
            email: email.to_string(),
            password_digest: "digest".to_string(),
            created_at: at(0, 0),
        }
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = MemStore::new();
        let first = store.insert_identity(new_identity("a@example.com")).await;
        assert!(first.is_ok());

        let second = store.insert_identity(new_identity("a@example.com")).await;
        assert!(matches!(second, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn revoke_has_one_winner() {
        let store = MemStore::new();
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
            secret_digest: vec![1, 2, 3],
            expires_at: at(12, 0),
            revoked: false,
            created_at: at(0, 0),
        };
        assert!(store.insert_refresh_token(record).await.is_ok());

        assert_eq!(store.revoke_refresh_token(&[1, 2, 3]).await.ok(), Some(true));
        assert_eq!(
            store.revoke_refresh_token(&[1, 2, 3]).await.ok(),
            Some(false)
        );
        assert_eq!(
            store.revoke_refresh_token(&[9, 9, 9]).await.ok(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn rate_limit_window_resets_after_expiry() {
        let store = MemStore::new();
        let window = Duration::hours(1);

        for attempt in 1..=3 {
            let outcome = store
                .rate_limit_hit("a@example.com", 3, window, at(10, 0))
                .await
                .ok();
            assert_eq!(outcome.map(|o| (o.allowed, o.attempts)), Some((true, attempt)));
        }
        let denied = store
            .rate_limit_hit("a@example.com", 3, window, at(10, 30))
            .await
            .ok();
        assert_eq!(denied.map(|o| o.allowed), Some(false));

        // A call after the window elapses starts a fresh window.
        let reset = store
            .rate_limit_hit("a@example.com", 3, window, at(11, 30))
            .await
            .ok();
        assert_eq!(reset.map(|o| (o.allowed, o.attempts)), Some((true, 1)));
    }

    #[tokio::test]
    async fn usage_accumulates_and_reads_zero_without_rows() {
        let store = MemStore::new();
        let identity_id = Uuid::new_v4();

        let empty = store.usage_for_month(identity_id, "2026-03").await.ok();
        assert_eq!(empty, Some(UsageRecord::default()));

        assert!(store.add_usage(identity_id, "2026-03", 2, 1).await.is_ok());
        assert!(store.add_usage(identity_id, "2026-03", 3, 0).await.is_ok());

        let usage = store.usage_for_month(identity_id, "2026-03").await.ok();
        assert_eq!(
            usage,
            Some(UsageRecord {
                api_requests: 5,
                sms_sent: 1
            })
        );
        let other_month = store.usage_for_month(identity_id, "2026-04").await.ok();
        assert_eq!(other_month, Some(UsageRecord::default()));
    }

    #[tokio::test]
    async fn downgrade_only_touches_expired_trials() {
        let store = MemStore::new();
        let identity_id = Uuid::new_v4();
        let record = SubscriptionRecord {
            identity_id,
            plan_code: "professional".to_string(),
            status: SubscriptionStatus::Trial,
            is_trial: true,
            trial_ends_at: Some(at(12, 0)),
            billing_cycle: crate::store::BillingCycle::Monthly,
            external_ref: None,
            updated_at: at(0, 0),
        };
        assert!(store.upsert_subscription(record).await.is_ok());

        // Still inside the trial window: no-op.
        let early = store
            .downgrade_expired_trial(identity_id, "free", at(11, 0))
            .await
            .ok();
        assert_eq!(early, Some(false));

        let late = store
            .downgrade_expired_trial(identity_id, "free", at(13, 0))
            .await
            .ok();
        assert_eq!(late, Some(true));

        let subscription = store
            .subscription_by_identity(identity_id)
            .await
            .ok()
            .flatten();
        assert_eq!(
            subscription.as_ref().map(|s| s.status),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            subscription.as_ref().map(|s| s.plan_code.as_str()),
            Some("free")
        );
        assert_eq!(subscription.and_then(|s| s.trial_ends_at), None);

        // Idempotent: the row is no longer a trial.
        let again = store
            .downgrade_expired_trial(identity_id, "free", at(14, 0))
            .await
            .ok();
        assert_eq!(again, Some(false));
    }
}
