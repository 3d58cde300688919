//! Outbound notification seam for verification and reset secrets.
//!
//! Delivery is fire-and-forget from the engine's perspective: a failed send is
//! logged but never rolls back the token issuance that produced the secret.

use anyhow::Result;
use secrecy::SecretString;
use tracing::info;

pub trait NotificationSender: Send + Sync {
    /// Hand off a verification secret for delivery to `email`.
    ///
    /// # Errors
    /// Returns an error when the handoff fails; the caller logs and continues.
    fn send_verification(&self, email: &str, secret: &SecretString) -> Result<()>;

    /// Hand off a password-reset secret for delivery to `email`.
    ///
    /// # Errors
    /// Returns an error when the handoff fails; the caller logs and continues.
    fn send_reset(&self, email: &str, secret: &SecretString) -> Result<()>;
}

/// Local dev sender that logs the handoff instead of delivering. The secret
/// itself never reaches the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotificationSender;

impl NotificationSender for LogNotificationSender {
    fn send_verification(&self, email: &str, _secret: &SecretString) -> Result<()> {
        info!(to_email = %email, template = "verify_email", "notification send stub");
        Ok(())
    }

    fn send_reset(&self, email: &str, _secret: &SecretString) -> Result<()> {
        info!(to_email = %email, template = "reset_password", "notification send stub");
        Ok(())
    }
}
