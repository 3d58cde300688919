//! Credential operations facade.
//!
//! The caller-facing surface for the excluded transport layer: register,
//! verify, login, refresh, logout, and the password flows. Responses are
//! enumeration-resistant: forgot-password and resend-verification always
//! report generic success, and login never reveals whether an email exists.

pub mod password;
pub mod rate_limit;
pub mod refresh;
pub mod verification;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLevel, AuditSink};
use crate::clock::Clock;
use crate::error::Error;
use crate::store::{IdentityRecord, NewIdentity, Store, StoreError};

use rate_limit::{FixedWindowLimiter, RateLimitDecision};
use refresh::{CredentialTokenManager, IssuedCredentials};
use verification::VerificationManager;

/// Normalize an email for lookup and uniqueness checks.
#[must_use]
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

pub struct AuthService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    credentials: Arc<CredentialTokenManager>,
    verification: Arc<VerificationManager>,
    limiter: Arc<FixedWindowLimiter>,
    min_password_len: usize,
}

impl AuthService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        credentials: Arc<CredentialTokenManager>,
        verification: Arc<VerificationManager>,
        limiter: Arc<FixedWindowLimiter>,
        min_password_len: usize,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            credentials,
            verification,
            limiter,
            min_password_len,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialTokenManager {
        &self.credentials
    }

    /// The issuance limiter, for transports that gate additional endpoints.
    #[must_use]
    pub fn limiter(&self) -> &FixedWindowLimiter {
        &self.limiter
    }

    /// Load an identity for a principal lookup (e.g. from bearer claims).
    ///
    /// # Errors
    /// `UserNotFound` when no such identity exists.
    pub async fn identity(&self, identity_id: Uuid) -> Result<IdentityRecord, Error> {
        self.store
            .identity_by_id(identity_id)
            .await?
            .ok_or(Error::UserNotFound)
    }

    /// Create an identity and send the first verification mail (through the
    /// limiter, like every verification issuance).
    ///
    /// # Errors
    /// `EmailAlreadyRegistered` on a taken address, `Validation` for a
    /// malformed email or weak password.
    pub async fn register(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<IdentityRecord, Error> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(Error::Validation("invalid email".to_string()));
        }
        self.check_password_policy(password)?;

        let password_digest = password::hash_password(password)?;
        let identity = match self
            .store
            .insert_identity(NewIdentity {
                email: email.clone(),
                password_digest,
                created_at: self.clock.now(),
            })
            .await
        {
            Ok(identity) => identity,
            Err(StoreError::Conflict) => return Err(Error::EmailAlreadyRegistered),
            Err(err) => return Err(err.into()),
        };

        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "identity.registered", "identity created")
                .with_identity(identity.id),
        );
        if self.limiter.check(&email).await? == RateLimitDecision::Allowed {
            self.verification.issue_verification(&identity).await?;
        }
        Ok(identity)
    }

    /// Consume a verification secret; starts the trial on success.
    ///
    /// # Errors
    /// `InvalidToken`, `EmailAlreadyVerified`, or `TokenExpired`.
    pub async fn verify_email(&self, secret: &SecretString) -> Result<Uuid, Error> {
        self.verification.consume_verification(secret).await
    }

    /// Re-send the verification mail. Always reports success so callers
    /// cannot probe for accounts; the limiter gates the actual send.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn resend_verification(&self, email: &str) -> Result<(), Error> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Ok(());
        }
        if self.limiter.check(&email).await? == RateLimitDecision::Limited {
            return Ok(());
        }
        let Some(identity) = self.store.identity_by_email(&email).await? else {
            return Ok(());
        };
        if identity.verified {
            return Ok(());
        }
        self.verification.issue_verification(&identity).await
    }

    /// Authenticate and issue a credential pair.
    ///
    /// An unverified login silently re-triggers the verification mail exactly
    /// when the limiter allows it; rate limiting only changes the messaging,
    /// never the error variant.
    ///
    /// # Errors
    /// `InvalidCredentials` for unknown emails or wrong passwords,
    /// `EmailNotVerified` until the address is confirmed.
    pub async fn login(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<IssuedCredentials, Error> {
        let email = normalize_email(email);
        let Some(identity) = self.store.identity_by_email(&email).await? else {
            return Err(Error::InvalidCredentials);
        };
        if !password::verify_password(password, &identity.password_digest)? {
            self.audit.record(
                AuditEntry::new(AuditLevel::Warn, "login.denied", "wrong password")
                    .with_identity(identity.id)
                    .with_error_code("INVALID_CREDENTIALS"),
            );
            return Err(Error::InvalidCredentials);
        }
        if !identity.verified {
            let verification_resent =
                self.limiter.check(&email).await? == RateLimitDecision::Allowed;
            if verification_resent {
                self.verification.issue_verification(&identity).await?;
            }
            return Err(Error::EmailNotVerified {
                verification_resent,
            });
        }
        self.credentials.issue(&identity).await
    }

    /// Rotate a refresh secret into a fresh credential pair.
    ///
    /// # Errors
    /// See [`CredentialTokenManager::rotate`].
    pub async fn refresh(&self, refresh_secret: &SecretString) -> Result<IssuedCredentials, Error> {
        self.credentials.rotate(refresh_secret).await
    }

    /// Revoke the presented refresh secret. Idempotent.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn logout(&self, refresh_secret: &SecretString) -> Result<bool, Error> {
        self.credentials.revoke(refresh_secret).await
    }

    /// Revoke every refresh secret for the identity.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn logout_all(&self, identity_id: Uuid) -> Result<u64, Error> {
        self.credentials.revoke_all(identity_id).await
    }

    /// Issue a password-reset mail. Always reports success; unknown emails
    /// and rate-limited requests are indistinguishable from real sends.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn forgot_password(&self, email: &str) -> Result<(), Error> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Ok(());
        }
        if self.limiter.check(&email).await? == RateLimitDecision::Limited {
            return Ok(());
        }
        let Some(identity) = self.store.identity_by_email(&email).await? else {
            return Ok(());
        };
        self.verification.issue_reset(&identity).await
    }

    /// Consume a reset secret and install a new password. All existing
    /// sessions are revoked.
    ///
    /// # Errors
    /// `InvalidToken`/`TokenExpired` per the secret, `Validation` for a weak
    /// password.
    pub async fn reset_password(
        &self,
        secret: &SecretString,
        new_password: &SecretString,
    ) -> Result<(), Error> {
        self.check_password_policy(new_password)?;
        let password_digest = password::hash_password(new_password)?;
        self.verification
            .consume_reset(secret, &password_digest)
            .await?;
        Ok(())
    }

    fn check_password_policy(&self, password: &SecretString) -> Result<(), Error> {
        if password.expose_secret().len() < self.min_password_len {
            return Err(Error::Validation(format!(
                "password must be at least {} characters",
                self.min_password_len
            )));
        }
        Ok(())
    }
}
