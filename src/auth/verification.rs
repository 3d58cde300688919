//! Single-use verification and password-reset tokens.
//!
//! Both flows store only the secret's digest on the identity, time-boxed
//! (24 h for verification, 1 h for reset), and hand the plaintext to the
//! notification collaborator exactly once. Lookups run on the digest; the
//! digest is already one-way, so the store's equality lookup is the
//! comparison.

use chrono::Duration;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLevel, AuditSink};
use crate::clock::Clock;
use crate::error::Error;
use crate::notify::NotificationSender;
use crate::store::{IdentityRecord, Store};
use crate::subscription::SubscriptionService;
use crate::tokens;

use super::refresh::CredentialTokenManager;

pub struct VerificationManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSender>,
    credentials: Arc<CredentialTokenManager>,
    subscriptions: Arc<SubscriptionService>,
    verification_ttl: Duration,
    reset_ttl: Duration,
}

impl VerificationManager {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSender>,
        credentials: Arc<CredentialTokenManager>,
        subscriptions: Arc<SubscriptionService>,
        verification_ttl: Duration,
        reset_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            notifier,
            credentials,
            subscriptions,
            verification_ttl,
            reset_ttl,
        }
    }

    /// Issue a fresh verification token, overwriting any pending one, and hand
    /// the plaintext to the notification collaborator.
    ///
    /// # Errors
    /// Store failures only; a failed notification handoff is logged, not
    /// propagated.
    pub async fn issue_verification(&self, identity: &IdentityRecord) -> Result<(), Error> {
        let secret = tokens::generate_secret().map_err(Error::Store)?;
        let digest = tokens::digest_exposed(&secret);
        let expires_at = self.clock.now() + self.verification_ttl;
        self.store
            .set_verification_token(identity.id, &digest, expires_at)
            .await?;

        if let Err(err) = self.notifier.send_verification(&identity.email, &secret) {
            error!("Failed to hand off verification notification: {err}");
        }
        self.audit.record(
            AuditEntry::new(
                AuditLevel::Info,
                "verification.issued",
                "verification token issued",
            )
            .with_identity(identity.id),
        );
        Ok(())
    }

    /// Consume a verification secret: mark the identity verified and start its
    /// trial. A trial-assignment failure does not roll back verification.
    ///
    /// # Errors
    /// `InvalidToken`, `EmailAlreadyVerified`, or `TokenExpired` per the
    /// presented secret's state.
    pub async fn consume_verification(&self, secret: &SecretString) -> Result<Uuid, Error> {
        let digest = tokens::digest_exposed(secret);
        let Some(identity) = self.store.identity_by_verification_digest(&digest).await? else {
            return Err(Error::InvalidToken);
        };
        if identity.verified {
            return Err(Error::EmailAlreadyVerified);
        }
        match identity.verification_expires_at {
            Some(expires_at) if expires_at > self.clock.now() => {}
            _ => return Err(Error::TokenExpired),
        }

        self.store.mark_verified(identity.id).await?;
        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "identity.verified", "email verified")
                .with_identity(identity.id),
        );

        // Separate write; verification stands even if the trial write fails.
        if let Err(err) = self.subscriptions.assign_trial(identity.id).await {
            error!("Failed to assign trial after verification: {err}");
            self.audit.record(
                AuditEntry::new(
                    AuditLevel::Warn,
                    "trial.assign_failed",
                    "trial assignment failed after verification",
                )
                .with_identity(identity.id)
                .with_error_code(err.code()),
            );
        }
        Ok(identity.id)
    }

    /// Issue a password-reset token, overwriting any pending one.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn issue_reset(&self, identity: &IdentityRecord) -> Result<(), Error> {
        let secret = tokens::generate_secret().map_err(Error::Store)?;
        let digest = tokens::digest_exposed(&secret);
        let expires_at = self.clock.now() + self.reset_ttl;
        self.store
            .set_reset_token(identity.id, &digest, expires_at)
            .await?;

        if let Err(err) = self.notifier.send_reset(&identity.email, &secret) {
            error!("Failed to hand off reset notification: {err}");
        }
        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "reset.issued", "reset token issued")
                .with_identity(identity.id),
        );
        Ok(())
    }

    /// Consume a reset secret and install the new password digest. A changed
    /// password invalidates every existing session for the identity.
    ///
    /// # Errors
    /// `InvalidToken` or `TokenExpired` per the presented secret's state.
    pub async fn consume_reset(
        &self,
        secret: &SecretString,
        new_password_digest: &str,
    ) -> Result<Uuid, Error> {
        let digest = tokens::digest_exposed(secret);
        let Some(identity) = self.store.identity_by_reset_digest(&digest).await? else {
            return Err(Error::InvalidToken);
        };
        match identity.reset_expires_at {
            Some(expires_at) if expires_at > self.clock.now() => {}
            _ => return Err(Error::TokenExpired),
        }

        self.store
            .complete_password_reset(identity.id, new_password_digest)
            .await?;
        self.credentials.revoke_all(identity.id).await?;
        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "password.reset", "password reset completed")
                .with_identity(identity.id),
        );
        Ok(identity.id)
    }
}
