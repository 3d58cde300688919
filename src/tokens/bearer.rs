//! Short-lived signed bearer assertions.
//!
//! Assertions carry the identity id and email, are HS256-signed, and expire
//! after the configured TTL. Keys are injected at construction; there is no
//! process-global signing state.

use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerClaims {
    pub sub: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

impl BearerClaims {
    /// Identity id carried in `sub`, if it parses.
    #[must_use]
    pub fn identity_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

pub struct BearerCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: i64,
}

impl BearerCodec {
    #[must_use]
    pub fn new(secret: &SecretString, ttl_seconds: i64) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            ttl_seconds,
        }
    }

    /// Sign an assertion for the identity, valid from `now` for the TTL.
    ///
    /// # Errors
    /// Signing failures are fatal; they indicate key or serialization faults.
    pub fn sign(&self, identity_id: Uuid, email: &str, now: DateTime<Utc>) -> Result<String, Error> {
        let claims = BearerClaims {
            sub: identity_id.to_string(),
            email: email.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + self.ttl_seconds,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| Error::Store(anyhow::anyhow!("failed to sign bearer assertion: {err}")))
    }

    /// Verify a presented assertion and return its claims.
    ///
    /// # Errors
    /// `TokenExpired` when past `exp`, `InvalidToken` for any other defect.
    pub fn verify(&self, assertion: &str) -> Result<BearerClaims, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<BearerClaims>(assertion, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => Error::TokenExpired,
                _ => Error::InvalidToken,
            })
    }
}
