//! Engine configuration: TTLs, caps, windows, and trial policy.

use anyhow::{Context, Result};
use secrecy::SecretString;

const DEFAULT_BEARER_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_VERIFICATION_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_RESEND_LIMIT: i64 = 3;
const DEFAULT_RESEND_WINDOW_SECONDS: i64 = 60 * 60;
const DEFAULT_TRIAL_DAYS: i64 = 14;
const DEFAULT_TRIAL_DOMAIN_CAP: i64 = 10;
const DEFAULT_TRIAL_SMS_CAP: i64 = 10;
const DEFAULT_MIN_PASSWORD_LEN: usize = 8;

/// Configuration for every engine component. Constructed with defaults and
/// adjusted through `with_*` builders, or read from `RAJTO_*` environment
/// variables via [`EngineConfig::from_env`].
#[derive(Debug)]
pub struct EngineConfig {
    bearer_secret: SecretString,
    bearer_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    verification_ttl_seconds: i64,
    reset_ttl_seconds: i64,
    resend_limit: i64,
    resend_window_seconds: i64,
    trial_days: i64,
    trial_domain_cap: i64,
    trial_sms_cap: i64,
    min_password_len: usize,
}

impl EngineConfig {
    #[must_use]
    pub fn new(bearer_secret: SecretString) -> Self {
        Self {
            bearer_secret,
            bearer_ttl_seconds: DEFAULT_BEARER_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            verification_ttl_seconds: DEFAULT_VERIFICATION_TTL_SECONDS,
            reset_ttl_seconds: DEFAULT_RESET_TTL_SECONDS,
            resend_limit: DEFAULT_RESEND_LIMIT,
            resend_window_seconds: DEFAULT_RESEND_WINDOW_SECONDS,
            trial_days: DEFAULT_TRIAL_DAYS,
            trial_domain_cap: DEFAULT_TRIAL_DOMAIN_CAP,
            trial_sms_cap: DEFAULT_TRIAL_SMS_CAP,
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
        }
    }

    /// Read configuration from the environment. `RAJTO_BEARER_SECRET` is
    /// required; every other variable falls back to its default.
    ///
    /// # Errors
    /// Returns an error when the secret is missing or a numeric variable does
    /// not parse.
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("RAJTO_BEARER_SECRET")
            .context("RAJTO_BEARER_SECRET must be set")
            .map(SecretString::from)?;

        let mut config = Self::new(secret);
        config.bearer_ttl_seconds = env_i64("RAJTO_BEARER_TTL_SECONDS", config.bearer_ttl_seconds)?;
        config.refresh_ttl_seconds =
            env_i64("RAJTO_REFRESH_TTL_SECONDS", config.refresh_ttl_seconds)?;
        config.verification_ttl_seconds = env_i64(
            "RAJTO_VERIFICATION_TTL_SECONDS",
            config.verification_ttl_seconds,
        )?;
        config.reset_ttl_seconds = env_i64("RAJTO_RESET_TTL_SECONDS", config.reset_ttl_seconds)?;
        config.resend_limit = env_i64("RAJTO_RESEND_LIMIT", config.resend_limit)?;
        config.resend_window_seconds =
            env_i64("RAJTO_RESEND_WINDOW_SECONDS", config.resend_window_seconds)?;
        config.trial_days = env_i64("RAJTO_TRIAL_DAYS", config.trial_days)?;
        Ok(config)
    }

    #[must_use]
    pub fn with_bearer_ttl_seconds(mut self, seconds: i64) -> Self {
        self.bearer_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_verification_ttl_seconds(mut self, seconds: i64) -> Self {
        self.verification_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_resend_limit(mut self, limit: i64) -> Self {
        self.resend_limit = limit;
        self
    }

    #[must_use]
    pub fn with_resend_window_seconds(mut self, seconds: i64) -> Self {
        self.resend_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_trial_days(mut self, days: i64) -> Self {
        self.trial_days = days;
        self
    }

    #[must_use]
    pub fn with_trial_caps(mut self, domains: i64, sms: i64) -> Self {
        self.trial_domain_cap = domains;
        self.trial_sms_cap = sms;
        self
    }

    #[must_use]
    pub fn with_min_password_len(mut self, len: usize) -> Self {
        self.min_password_len = len;
        self
    }

    #[must_use]
    pub fn bearer_secret(&self) -> &SecretString {
        &self.bearer_secret
    }

    #[must_use]
    pub fn bearer_ttl_seconds(&self) -> i64 {
        self.bearer_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    #[must_use]
    pub fn verification_ttl_seconds(&self) -> i64 {
        self.verification_ttl_seconds
    }

    #[must_use]
    pub fn reset_ttl_seconds(&self) -> i64 {
        self.reset_ttl_seconds
    }

    #[must_use]
    pub fn resend_limit(&self) -> i64 {
        self.resend_limit
    }

    #[must_use]
    pub fn resend_window_seconds(&self) -> i64 {
        self.resend_window_seconds
    }

    #[must_use]
    pub fn trial_days(&self) -> i64 {
        self.trial_days
    }

    #[must_use]
    pub fn trial_domain_cap(&self) -> i64 {
        self.trial_domain_cap
    }

    #[must_use]
    pub fn trial_sms_cap(&self) -> i64 {
        self.trial_sms_cap
    }

    #[must_use]
    pub fn min_password_len(&self) -> usize {
        self.min_password_len
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<i64>()
            .with_context(|| format!("{name} must be an integer")),
        Err(_) => Ok(default),
    }
}
