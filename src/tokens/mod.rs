//! Opaque secret generation and digesting.
//!
//! Secrets are random 32-byte values handed to the caller exactly once; only
//! their SHA-256 digest is ever persisted, and lookups run against the digest.

pub mod bearer;

use anyhow::{Context, Result};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Generate a new opaque secret (refresh, verification, or reset).
///
/// # Errors
/// Returns an error when the system randomness source fails.
pub fn generate_secret() -> Result<SecretString> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate opaque secret")?;
    Ok(SecretString::from(
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
    ))
}

/// One-way digest used to store and look up an opaque secret.
#[must_use]
pub fn digest(secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

#[must_use]
pub fn digest_exposed(secret: &SecretString) -> Vec<u8> {
    digest(secret.expose_secret())
}
