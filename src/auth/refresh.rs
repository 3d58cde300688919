//! Refresh-token families: issue, rotate, revoke, and reuse detection.
//!
//! A refresh secret is single-use. Presenting an already-rotated secret is
//! treated as a credential-theft signal and revokes the whole family, forcing
//! re-authentication everywhere.

use chrono::Duration;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLevel, AuditSink};
use crate::clock::Clock;
use crate::error::Error;
use crate::store::{IdentityRecord, RefreshTokenRecord, Store};
use crate::tokens::{self, bearer::BearerCodec};

/// A freshly issued credential pair. The refresh secret is handed out exactly
/// once; only its digest is persisted.
pub struct IssuedCredentials {
    pub identity_id: Uuid,
    pub bearer_assertion: String,
    pub refresh_secret: SecretString,
}

pub struct CredentialTokenManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    bearer: BearerCodec,
    refresh_ttl: Duration,
}

impl CredentialTokenManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        bearer: BearerCodec,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            bearer,
            refresh_ttl,
        }
    }

    #[must_use]
    pub fn bearer(&self) -> &BearerCodec {
        &self.bearer
    }

    /// Issue a signed bearer assertion plus a fresh refresh secret, persisting
    /// one new record holding the secret's digest.
    ///
    /// # Errors
    /// Store or signing failures only.
    pub async fn issue(&self, identity: &IdentityRecord) -> Result<IssuedCredentials, Error> {
        let now = self.clock.now();
        let secret = tokens::generate_secret().map_err(Error::Store)?;
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            identity_id: identity.id,
            secret_digest: tokens::digest_exposed(&secret),
            expires_at: now + self.refresh_ttl,
            revoked: false,
            created_at: now,
        };
        self.store.insert_refresh_token(record).await?;

        let bearer_assertion = self.bearer.sign(identity.id, &identity.email, now)?;
        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "token.issued", "credential pair issued")
                .with_identity(identity.id),
        );
        Ok(IssuedCredentials {
            identity_id: identity.id,
            bearer_assertion,
            refresh_secret: secret,
        })
    }

    /// Rotate a presented refresh secret into a fresh pair.
    ///
    /// # Errors
    /// `InvalidToken` for unknown secrets, `TokenExpired` past the record's
    /// expiry, `TokenReuseDetected` when the record is already revoked or a
    /// concurrent rotation won the race (the whole family is revoked first).
    pub async fn rotate(&self, presented: &SecretString) -> Result<IssuedCredentials, Error> {
        let digest = tokens::digest_exposed(presented);
        let Some(record) = self.store.refresh_token_by_digest(&digest).await? else {
            return Err(Error::InvalidToken);
        };
        if record.revoked {
            return Err(self.flag_reuse(record.identity_id).await?);
        }
        if record.expires_at <= self.clock.now() {
            return Err(Error::TokenExpired);
        }

        // Closing the rotation window: exactly one concurrent caller revokes
        // the record. A loser observes it already revoked, which is reuse.
        if !self.store.revoke_refresh_token(&digest).await? {
            return Err(self.flag_reuse(record.identity_id).await?);
        }

        let identity = self
            .store
            .identity_by_id(record.identity_id)
            .await?
            .ok_or(Error::InvalidToken)?;
        let issued = self.issue(&identity).await?;
        self.audit.record(
            AuditEntry::new(AuditLevel::Info, "token.rotated", "refresh secret rotated")
                .with_identity(identity.id),
        );
        Ok(issued)
    }

    /// Revoke a single record by presented secret; returns whether anything
    /// was revoked.
    ///
    /// # Errors
    /// Store failures only; an unknown or already-revoked secret is `false`.
    pub async fn revoke(&self, presented: &SecretString) -> Result<bool, Error> {
        let digest = tokens::digest_exposed(presented);
        let revoked = self.store.revoke_refresh_token(&digest).await?;
        if revoked {
            self.audit.record(AuditEntry::new(
                AuditLevel::Info,
                "token.revoked",
                "refresh secret revoked",
            ));
        }
        Ok(revoked)
    }

    /// Revoke every active record for the identity ("log out everywhere").
    ///
    /// # Errors
    /// Store failures only.
    pub async fn revoke_all(&self, identity_id: Uuid) -> Result<u64, Error> {
        let revoked = self.store.revoke_all_refresh_tokens(identity_id).await?;
        self.audit.record(
            AuditEntry::new(
                AuditLevel::Info,
                "token.revoked_all",
                "refresh token family revoked",
            )
            .with_identity(identity_id)
            .with_metadata(json!({ "revoked": revoked })),
        );
        Ok(revoked)
    }

    async fn flag_reuse(&self, identity_id: Uuid) -> Result<Error, Error> {
        let revoked = self.store.revoke_all_refresh_tokens(identity_id).await?;
        self.audit.record(
            AuditEntry::new(
                AuditLevel::Security,
                "token.reuse_detected",
                "revoked refresh secret presented, family revoked",
            )
            .with_identity(identity_id)
            .with_error_code("TOKEN_REUSE_DETECTED")
            .with_metadata(json!({ "revoked": revoked })),
        );
        Ok(Error::TokenReuseDetected)
    }
}
