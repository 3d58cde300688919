//! Persistent store adapter.
//!
//! All cross-request coordination happens through this seam: point lookups,
//! conditional upserts/updates, and atomic increments, each a single atomic
//! statement with respect to concurrent callers. [`postgres::PgStore`] is the
//! production implementation; [`memory::MemStore`] mirrors its semantics for
//! isolated tests and embedding.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("conflicting row already exists")]
    Conflict,
    /// Fatal adapter failure; propagates upward unmodified.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for crate::error::Error {
    fn from(err: StoreError) -> Self {
        match err {
            // Conflicts are matched explicitly where they are a modeled
            // outcome; reaching this arm means an invariant was violated.
            StoreError::Conflict => {
                Self::Store(anyhow::anyhow!("unexpected uniqueness conflict"))
            }
            StoreError::Io(err) => Self::Store(err),
        }
    }
}

/// Unique identity record: normalized email, password digest, and the pending
/// single-use verification/reset token state.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub email: String,
    pub password_digest: String,
    pub verified: bool,
    pub verification_digest: Option<Vec<u8>>,
    pub verification_expires_at: Option<DateTime<Utc>>,
    pub reset_digest: Option<Vec<u8>>,
    pub reset_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub email: String,
    pub password_digest: String,
    pub created_at: DateTime<Utc>,
}

/// One row per issued refresh secret. Only the digest is stored; revocation is
/// one-way and rows are never deleted synchronously.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub secret_digest: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// Fixed-window counter state for one normalized key.
#[derive(Debug, Clone)]
pub struct RateLimitRecord {
    pub key: String,
    pub attempts: i64,
    pub window_started_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

/// Result of one atomic check-and-increment.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub attempts: i64,
}

/// Immutable plan reference data, seeded once. `None` in a monthly-limit field
/// is interpreted by the quota engine (see `EffectivePlan`); `unlimited` marks
/// the tier that bypasses every dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub code: String,
    pub name: String,
    pub max_domains: Option<i64>,
    pub max_team_members: Option<i64>,
    pub check_interval_seconds: i64,
    pub api_requests_per_month: Option<i64>,
    pub sms_per_month: Option<i64>,
    pub email_alerts: bool,
    pub sms_alerts: bool,
    pub slack_alerts: bool,
    pub unlimited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    Trial,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Trial => "trial",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            "trial" => Some(Self::Trial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

/// At most one row per identity, enforced by a uniqueness constraint.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub identity_id: Uuid,
    pub plan_code: String,
    pub status: SubscriptionStatus,
    pub is_trial: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub billing_cycle: BillingCycle,
    pub external_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Monthly counters for one identity. Months without a row read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageRecord {
    pub api_requests: i64,
    pub sms_sent: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new identity; `Conflict` when the email is taken.
    async fn insert_identity(&self, identity: NewIdentity) -> StoreResult<IdentityRecord>;
    async fn identity_by_id(&self, id: Uuid) -> StoreResult<Option<IdentityRecord>>;
    async fn identity_by_email(&self, email: &str) -> StoreResult<Option<IdentityRecord>>;
    async fn identity_by_verification_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<IdentityRecord>>;
    async fn identity_by_reset_digest(&self, digest: &[u8])
        -> StoreResult<Option<IdentityRecord>>;
    /// Overwrites any previous pending verification token.
    async fn set_verification_token(
        &self,
        identity_id: Uuid,
        digest: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Marks the identity verified and clears the pending token fields.
    async fn mark_verified(&self, identity_id: Uuid) -> StoreResult<()>;
    async fn set_reset_token(
        &self,
        identity_id: Uuid,
        digest: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Replaces the password digest and clears the pending reset fields.
    async fn complete_password_reset(
        &self,
        identity_id: Uuid,
        password_digest: &str,
    ) -> StoreResult<()>;

    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> StoreResult<()>;
    async fn refresh_token_by_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<RefreshTokenRecord>>;
    /// Conditionally revoke one non-revoked record. Returns whether this call
    /// performed the revocation; a `false` means another caller won the race
    /// or the record was already revoked.
    async fn revoke_refresh_token(&self, digest: &[u8]) -> StoreResult<bool>;
    /// Revoke every non-revoked record for the identity; returns the count.
    async fn revoke_all_refresh_tokens(&self, identity_id: Uuid) -> StoreResult<u64>;

    /// Single-statement fixed-window check-and-increment. A fresh or expired
    /// window resets to one attempt; an active window increments up to `cap`;
    /// at the cap nothing is mutated and the outcome is a denial.
    async fn rate_limit_hit(
        &self,
        key: &str,
        cap: i64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitOutcome>;

    async fn seed_plans(&self, plans: &[PlanRecord]) -> StoreResult<()>;
    async fn plan_by_code(&self, code: &str) -> StoreResult<Option<PlanRecord>>;
    /// Full-row upsert keyed by identity id.
    async fn upsert_subscription(&self, record: SubscriptionRecord) -> StoreResult<()>;
    async fn subscription_by_identity(
        &self,
        identity_id: Uuid,
    ) -> StoreResult<Option<SubscriptionRecord>>;
    /// Conditional full-row rewrite to the base plan when the row is an
    /// expired trial. Returns whether a downgrade happened.
    async fn downgrade_expired_trial(
        &self,
        identity_id: Uuid,
        base_plan_code: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Cancels only rows currently `active`.
    async fn cancel_active_subscription(
        &self,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Atomic insert-or-add for the identity's monthly counters.
    async fn add_usage(
        &self,
        identity_id: Uuid,
        month: &str,
        api_delta: i64,
        sms_delta: i64,
    ) -> StoreResult<()>;
    async fn usage_for_month(&self, identity_id: Uuid, month: &str) -> StoreResult<UsageRecord>;
}

#[cfg(test)]
mod tests {
    use super::{BillingCycle, SubscriptionStatus};

    #[test]
    fn subscription_status_round_trips() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Trial,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse("paused"), None);
    }

    #[test]
    fn billing_cycle_round_trips() {
        for cycle in [BillingCycle::Monthly, BillingCycle::Yearly] {
            assert_eq!(BillingCycle::parse(cycle.as_str()), Some(cycle));
        }
        assert_eq!(BillingCycle::parse("weekly"), None);
    }
}
