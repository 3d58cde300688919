//! Caller-visible error taxonomy.
//!
//! Every variant except [`Error::Store`] is an expected outcome that the
//! consuming transport layer maps to a response; none of them should abort a
//! worker. `Store` wraps fatal adapter failures and propagates unmodified.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("email is already registered")]
    EmailAlreadyRegistered,

    /// Login on an unverified account. `verification_resent` records whether a
    /// fresh verification mail was silently triggered for this attempt.
    #[error("email is not verified")]
    EmailNotVerified { verification_resent: bool },

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("email is already verified")]
    EmailAlreadyVerified,

    #[error("rate limited, try again later")]
    RateLimitExceeded,

    #[error("user not found")]
    UserNotFound,

    /// An already-rotated refresh secret was presented. The whole token family
    /// has been revoked; the caller must re-authenticate.
    #[error("token reuse detected, re-authenticate")]
    TokenReuseDetected,

    #[error("feature not available on the current plan")]
    FeatureNotAvailable,

    #[error("domain limit reached")]
    DomainLimitReached,

    #[error("team member limit reached")]
    TeamLimitReached,

    #[error("sms limit reached for this month")]
    SmsLimitReached,

    #[error("api request limit reached for this month")]
    ApiLimitReached,

    #[error("validation failed: {0}")]
    Validation(String),

    /// Fatal store/adapter failure; never mapped into the domain taxonomy.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable code, used in audit entries and by transports.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::EmailAlreadyRegistered => "EMAIL_ALREADY_REGISTERED",
            Self::EmailNotVerified { .. } => "EMAIL_NOT_VERIFIED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::EmailAlreadyVerified => "EMAIL_ALREADY_VERIFIED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::TokenReuseDetected => "TOKEN_REUSE_DETECTED",
            Self::FeatureNotAvailable => "FEATURE_NOT_AVAILABLE",
            Self::DomainLimitReached => "DOMAIN_LIMIT_REACHED",
            Self::TeamLimitReached => "TEAM_LIMIT_REACHED",
            Self::SmsLimitReached => "SMS_LIMIT_REACHED",
            Self::ApiLimitReached => "API_LIMIT_REACHED",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Store(_) => "STORE_FAILURE",
        }
    }

    /// Whether the error is an expected outcome rather than a fatal fault.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}
