//! `PostgreSQL` store adapter.
//!
//! Every method is one statement, atomic with respect to concurrent callers:
//! conditional updates carry their predicate in `WHERE` and report success via
//! `RETURNING`, and counter writes are `ON CONFLICT ... DO UPDATE` adds.
//! Schema lives in `db/schema.sql`.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{
    BillingCycle, IdentityRecord, NewIdentity, PlanRecord, RateLimitOutcome, RefreshTokenRecord,
    Store, StoreError, StoreResult, SubscriptionRecord, SubscriptionStatus, UsageRecord,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn identity_where(
        &self,
        query: &str,
        bind: IdentityLookup<'_>,
    ) -> StoreResult<Option<IdentityRecord>> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let statement = sqlx::query(query);
        let statement = match bind {
            IdentityLookup::Id(id) => statement.bind(id),
            IdentityLookup::Email(email) => statement.bind(email),
            IdentityLookup::Digest(digest) => statement.bind(digest),
        };
        let row = statement
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up identity")?;
        Ok(row.map(|row| identity_from_row(&row)))
    }
}

enum IdentityLookup<'a> {
    Id(Uuid),
    Email(&'a str),
    Digest(&'a [u8]),
}

const IDENTITY_COLUMNS: &str = "id, email, password_digest, verified, verification_digest, \
     verification_expires_at, reset_digest, reset_expires_at, created_at";

fn identity_from_row(row: &PgRow) -> IdentityRecord {
    IdentityRecord {
        id: row.get("id"),
        email: row.get("email"),
        password_digest: row.get("password_digest"),
        verified: row.get("verified"),
        verification_digest: row.get("verification_digest"),
        verification_expires_at: row.get("verification_expires_at"),
        reset_digest: row.get("reset_digest"),
        reset_expires_at: row.get("reset_expires_at"),
        created_at: row.get("created_at"),
    }
}

fn refresh_token_from_row(row: &PgRow) -> RefreshTokenRecord {
    RefreshTokenRecord {
        id: row.get("id"),
        identity_id: row.get("identity_id"),
        secret_digest: row.get("secret_digest"),
        expires_at: row.get("expires_at"),
        revoked: row.get("revoked"),
        created_at: row.get("created_at"),
    }
}

fn plan_from_row(row: &PgRow) -> PlanRecord {
    PlanRecord {
        code: row.get("code"),
        name: row.get("name"),
        max_domains: row.get("max_domains"),
        max_team_members: row.get("max_team_members"),
        check_interval_seconds: row.get("check_interval_seconds"),
        api_requests_per_month: row.get("api_requests_per_month"),
        sms_per_month: row.get("sms_per_month"),
        email_alerts: row.get("email_alerts"),
        sms_alerts: row.get("sms_alerts"),
        slack_alerts: row.get("slack_alerts"),
        unlimited: row.get("unlimited"),
    }
}

fn subscription_from_row(row: &PgRow) -> StoreResult<SubscriptionRecord> {
    let status: String = row.get("status");
    let cycle: String = row.get("billing_cycle");
    Ok(SubscriptionRecord {
        identity_id: row.get("identity_id"),
        plan_code: row.get("plan_code"),
        status: SubscriptionStatus::parse(&status)
            .ok_or_else(|| StoreError::Io(anyhow!("unknown subscription status: {status}")))?,
        is_trial: row.get("is_trial"),
        trial_ends_at: row.get("trial_ends_at"),
        billing_cycle: BillingCycle::parse(&cycle)
            .ok_or_else(|| StoreError::Io(anyhow!("unknown billing cycle: {cycle}")))?,
        external_ref: row.get("external_ref"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_identity(&self, identity: NewIdentity) -> StoreResult<IdentityRecord> {
        let query = "INSERT INTO identities (id, email, password_digest, created_at) \
             VALUES ($1, $2, $3, $4)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let id = Uuid::new_v4();
        let result = sqlx::query(query)
            .bind(id)
            .bind(&identity.email)
            .bind(&identity.password_digest)
            .bind(identity.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await;

        match result {
            Ok(_) => Ok(IdentityRecord {
                id,
                email: identity.email,
                password_digest: identity.password_digest,
                verified: false,
                verification_digest: None,
                verification_expires_at: None,
                reset_digest: None,
                reset_expires_at: None,
                created_at: identity.created_at,
            }),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict),
            Err(err) => Err(StoreError::Io(
                anyhow::Error::from(err).context("failed to insert identity"),
            )),
        }
    }

    async fn identity_by_id(&self, id: Uuid) -> StoreResult<Option<IdentityRecord>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        self.identity_where(&query, IdentityLookup::Id(id)).await
    }

    async fn identity_by_email(&self, email: &str) -> StoreResult<Option<IdentityRecord>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE email = $1");
        self.identity_where(&query, IdentityLookup::Email(email))
            .await
    }

    async fn identity_by_verification_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<IdentityRecord>> {
        let query =
            format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE verification_digest = $1");
        self.identity_where(&query, IdentityLookup::Digest(digest))
            .await
    }

    async fn identity_by_reset_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<IdentityRecord>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE reset_digest = $1");
        self.identity_where(&query, IdentityLookup::Digest(digest))
            .await
    }

    async fn set_verification_token(
        &self,
        identity_id: Uuid,
        digest: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = "UPDATE identities \
             SET verification_digest = $2, verification_expires_at = $3 \
             WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(identity_id)
            .bind(digest)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to set verification token")?;
        Ok(())
    }

    async fn mark_verified(&self, identity_id: Uuid) -> StoreResult<()> {
        let query = "UPDATE identities \
             SET verified = TRUE, verification_digest = NULL, verification_expires_at = NULL \
             WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(identity_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to mark identity verified")?;
        Ok(())
    }

    async fn set_reset_token(
        &self,
        identity_id: Uuid,
        digest: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = "UPDATE identities SET reset_digest = $2, reset_expires_at = $3 WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(identity_id)
            .bind(digest)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to set reset token")?;
        Ok(())
    }

    async fn complete_password_reset(
        &self,
        identity_id: Uuid,
        password_digest: &str,
    ) -> StoreResult<()> {
        let query = "UPDATE identities \
             SET password_digest = $2, reset_digest = NULL, reset_expires_at = NULL \
             WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(identity_id)
            .bind(password_digest)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to complete password reset")?;
        Ok(())
    }

    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> StoreResult<()> {
        let query = "INSERT INTO refresh_tokens \
             (id, identity_id, secret_digest, expires_at, revoked, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(record.id)
            .bind(record.identity_id)
            .bind(&record.secret_digest)
            .bind(record.expires_at)
            .bind(record.revoked)
            .bind(record.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict),
            Err(err) => Err(StoreError::Io(
                anyhow::Error::from(err).context("failed to insert refresh token"),
            )),
        }
    }

    async fn refresh_token_by_digest(
        &self,
        digest: &[u8],
    ) -> StoreResult<Option<RefreshTokenRecord>> {
        let query = "SELECT id, identity_id, secret_digest, expires_at, revoked, created_at \
             FROM refresh_tokens WHERE secret_digest = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(digest)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up refresh token")?;
        Ok(row.map(|row| refresh_token_from_row(&row)))
    }

    async fn revoke_refresh_token(&self, digest: &[u8]) -> StoreResult<bool> {
        // The `revoked = FALSE` predicate makes this the rotation race arbiter:
        // exactly one concurrent caller sees a returned row.
        let query = "UPDATE refresh_tokens SET revoked = TRUE \
             WHERE secret_digest = $1 AND revoked = FALSE \
             RETURNING id";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(digest)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke refresh token")?;
        Ok(row.is_some())
    }

    async fn revoke_all_refresh_tokens(&self, identity_id: Uuid) -> StoreResult<u64> {
        let query = "UPDATE refresh_tokens SET revoked = TRUE \
             WHERE identity_id = $1 AND revoked = FALSE";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(identity_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke refresh token family")?;
        Ok(result.rows_affected())
    }

    async fn rate_limit_hit(
        &self,
        key: &str,
        cap: i64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitOutcome> {
        // One statement decides reset / increment / deny. A window that started
        // before the cutoff has elapsed and resets; otherwise the counter grows
        // only while under the cap. No returned row means a denial without
        // mutation.
        let query = "INSERT INTO rate_limits (limit_key, attempts, window_started_at, last_attempt_at) \
             VALUES ($1, 1, $2, $2) \
             ON CONFLICT (limit_key) DO UPDATE SET \
                 attempts = CASE WHEN rate_limits.window_started_at < $3 \
                     THEN 1 ELSE rate_limits.attempts + 1 END, \
                 window_started_at = CASE WHEN rate_limits.window_started_at < $3 \
                     THEN $2 ELSE rate_limits.window_started_at END, \
                 last_attempt_at = $2 \
             WHERE rate_limits.window_started_at < $3 OR rate_limits.attempts < $4 \
             RETURNING attempts";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let cutoff = now - window;
        let row = sqlx::query(query)
            .bind(key)
            .bind(now)
            .bind(cutoff)
            .bind(cap)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to record rate limit attempt")?;
        Ok(match row {
            Some(row) => RateLimitOutcome {
                allowed: true,
                attempts: row.get("attempts"),
            },
            None => RateLimitOutcome {
                allowed: false,
                attempts: cap,
            },
        })
    }

    async fn seed_plans(&self, plans: &[PlanRecord]) -> StoreResult<()> {
        let query = "INSERT INTO plans \
             (code, name, max_domains, max_team_members, check_interval_seconds, \
              api_requests_per_month, sms_per_month, email_alerts, sms_alerts, \
              slack_alerts, unlimited) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (code) DO UPDATE SET \
                 name = EXCLUDED.name, \
                 max_domains = EXCLUDED.max_domains, \
                 max_team_members = EXCLUDED.max_team_members, \
                 check_interval_seconds = EXCLUDED.check_interval_seconds, \
                 api_requests_per_month = EXCLUDED.api_requests_per_month, \
                 sms_per_month = EXCLUDED.sms_per_month, \
                 email_alerts = EXCLUDED.email_alerts, \
                 sms_alerts = EXCLUDED.sms_alerts, \
                 slack_alerts = EXCLUDED.slack_alerts, \
                 unlimited = EXCLUDED.unlimited";
        for plan in plans {
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(&plan.code)
                .bind(&plan.name)
                .bind(plan.max_domains)
                .bind(plan.max_team_members)
                .bind(plan.check_interval_seconds)
                .bind(plan.api_requests_per_month)
                .bind(plan.sms_per_month)
                .bind(plan.email_alerts)
                .bind(plan.sms_alerts)
                .bind(plan.slack_alerts)
                .bind(plan.unlimited)
                .execute(&self.pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to seed plan {}", plan.code))?;
        }
        Ok(())
    }

    async fn plan_by_code(&self, code: &str) -> StoreResult<Option<PlanRecord>> {
        let query = "SELECT code, name, max_domains, max_team_members, check_interval_seconds, \
             api_requests_per_month, sms_per_month, email_alerts, sms_alerts, slack_alerts, \
             unlimited \
             FROM plans WHERE code = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(code)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up plan")?;
        Ok(row.map(|row| plan_from_row(&row)))
    }

    async fn upsert_subscription(&self, record: SubscriptionRecord) -> StoreResult<()> {
        // Full-row replace so a concurrent partial patch cannot interleave.
        let query = "INSERT INTO subscriptions \
             (identity_id, plan_code, status, is_trial, trial_ends_at, billing_cycle, \
              external_ref, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (identity_id) DO UPDATE SET \
                 plan_code = EXCLUDED.plan_code, \
                 status = EXCLUDED.status, \
                 is_trial = EXCLUDED.is_trial, \
                 trial_ends_at = EXCLUDED.trial_ends_at, \
                 billing_cycle = EXCLUDED.billing_cycle, \
                 external_ref = EXCLUDED.external_ref, \
                 updated_at = EXCLUDED.updated_at";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.identity_id)
            .bind(&record.plan_code)
            .bind(record.status.as_str())
            .bind(record.is_trial)
            .bind(record.trial_ends_at)
            .bind(record.billing_cycle.as_str())
            .bind(&record.external_ref)
            .bind(record.updated_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to upsert subscription")?;
        Ok(())
    }

    async fn subscription_by_identity(
        &self,
        identity_id: Uuid,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        let query = "SELECT identity_id, plan_code, status, is_trial, trial_ends_at, \
             billing_cycle, external_ref, updated_at \
             FROM subscriptions WHERE identity_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identity_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up subscription")?;
        row.map(|row| subscription_from_row(&row)).transpose()
    }

    async fn downgrade_expired_trial(
        &self,
        identity_id: Uuid,
        base_plan_code: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = "UPDATE subscriptions \
             SET plan_code = $2, status = 'active', is_trial = FALSE, trial_ends_at = NULL, \
                 updated_at = $3 \
             WHERE identity_id = $1 AND status = 'trial' AND is_trial \
               AND trial_ends_at IS NOT NULL AND trial_ends_at < $3 \
             RETURNING identity_id";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identity_id)
            .bind(base_plan_code)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to downgrade expired trial")?;
        Ok(row.is_some())
    }

    async fn cancel_active_subscription(
        &self,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = "UPDATE subscriptions SET status = 'cancelled', updated_at = $2 \
             WHERE identity_id = $1 AND status = 'active' \
             RETURNING identity_id";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identity_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to cancel subscription")?;
        Ok(row.is_some())
    }

    async fn add_usage(
        &self,
        identity_id: Uuid,
        month: &str,
        api_delta: i64,
        sms_delta: i64,
    ) -> StoreResult<()> {
        let query = "INSERT INTO usage_records (identity_id, month, api_requests, sms_sent) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (identity_id, month) DO UPDATE SET \
                 api_requests = usage_records.api_requests + EXCLUDED.api_requests, \
                 sms_sent = usage_records.sms_sent + EXCLUDED.sms_sent";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(identity_id)
            .bind(month)
            .bind(api_delta)
            .bind(sms_delta)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to add usage")?;
        Ok(())
    }

    async fn usage_for_month(&self, identity_id: Uuid, month: &str) -> StoreResult<UsageRecord> {
        let query = "SELECT api_requests, sms_sent FROM usage_records \
             WHERE identity_id = $1 AND month = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identity_id)
            .bind(month)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up usage")?;
        Ok(row
            .map(|row| UsageRecord {
                api_requests: row.get("api_requests"),
                sms_sent: row.get("sms_sent"),
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::is_unique_violation;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
