//! Password digesting.
//!
//! Argon2 with per-digest random salts; the parsed digest string carries its
//! own parameters, so verification works across parameter upgrades.

use anyhow::anyhow;
use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

/// Digest a plaintext password for storage.
///
/// # Errors
/// Hashing failures are fatal; they indicate a salt or parameter fault.
pub fn hash_password(plain: &SecretString) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.expose_secret().as_bytes(), &salt)
        .map(|digest| digest.to_string())
        .map_err(|err| Error::Store(anyhow!("argon2 hash failed: {err}")))
}

/// Check a plaintext password against a stored digest.
///
/// # Errors
/// A digest that does not parse is fatal (corrupted storage).
pub fn verify_password(plain: &SecretString, digest: &str) -> Result<bool, Error> {
    let parsed = PasswordHash::new(digest)
        .map_err(|err| Error::Store(anyhow!("stored password digest invalid: {err}")))?;
    Ok(Argon2::default()
        .verify_password(plain.expose_secret().as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::{hash_password, verify_password};
    use secrecy::SecretString;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn hash_then_verify() {
        let digest = hash_password(&secret("correct horse battery"));
        let digest = digest.ok();
        assert!(digest.is_some());

        let digest = digest.unwrap_or_default();
        assert_eq!(
            verify_password(&secret("correct horse battery"), &digest).ok(),
            Some(true)
        );
        assert_eq!(
            verify_password(&secret("wrong password"), &digest).ok(),
            Some(false)
        );
    }

    #[test]
    fn digests_are_salted() {
        let first = hash_password(&secret("same password")).ok();
        let second = hash_password(&secret("same password")).ok();
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_digest_is_fatal() {
        assert!(verify_password(&secret("anything"), "not-a-digest").is_err());
    }
}
