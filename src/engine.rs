//! Engine assembly.
//!
//! One composition root wires every component onto the shared collaborators
//! (store, clock, audit sink, notification sender). Nothing here holds global
//! state; construct several engines against different stores if needed.

use chrono::Duration;
use std::sync::Arc;

use crate::audit::AuditSink;
use crate::auth::{
    rate_limit::FixedWindowLimiter, refresh::CredentialTokenManager,
    verification::VerificationManager, AuthService,
};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::notify::NotificationSender;
use crate::store::Store;
use crate::subscription::SubscriptionService;
use crate::tokens::bearer::BearerCodec;
use crate::usage::QuotaEngine;

pub struct Engine {
    auth: AuthService,
    subscriptions: Arc<SubscriptionService>,
    quotas: QuotaEngine,
}

impl Engine {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSender>,
        config: &EngineConfig,
    ) -> Self {
        let bearer = BearerCodec::new(config.bearer_secret(), config.bearer_ttl_seconds());
        let credentials = Arc::new(CredentialTokenManager::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            bearer,
            Duration::seconds(config.refresh_ttl_seconds()),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config,
        ));
        let verification = Arc::new(VerificationManager::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            notifier,
            credentials.clone(),
            subscriptions.clone(),
            Duration::seconds(config.verification_ttl_seconds()),
            Duration::seconds(config.reset_ttl_seconds()),
        ));
        let limiter = Arc::new(FixedWindowLimiter::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.resend_limit(),
            Duration::seconds(config.resend_window_seconds()),
        ));
        let auth = AuthService::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            credentials,
            verification,
            limiter,
            config.min_password_len(),
        );
        let quotas = QuotaEngine::new(store, clock, audit, subscriptions.clone());
        Self {
            auth,
            subscriptions,
            quotas,
        }
    }

    /// Seed the plan catalog; call once against a fresh store.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn seed_default_plans(&self) -> Result<(), Error> {
        self.subscriptions.seed_default_plans().await
    }

    #[must_use]
    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionService {
        &self.subscriptions
    }

    #[must_use]
    pub fn quotas(&self) -> &QuotaEngine {
        &self.quotas
    }
}
