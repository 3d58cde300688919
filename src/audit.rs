//! Structured audit entries for security-significant transitions.
//!
//! The engine emits one entry per transition (issue, rotate, reuse detected,
//! limit denied, trial assigned, trial expired, ...) and never depends on the
//! sink succeeding.

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warn,
    Security,
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub level: AuditLevel,
    pub action: &'static str,
    pub message: String,
    pub identity_id: Option<Uuid>,
    pub error_code: Option<&'static str>,
    pub metadata: Option<Value>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(level: AuditLevel, action: &'static str, message: impl Into<String>) -> Self {
        Self {
            level,
            action,
            message: message.into(),
            identity_id: None,
            error_code: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity_id: Uuid) -> Self {
        self.identity_id = Some(identity_id);
        self
    }

    #[must_use]
    pub fn with_error_code(mut self, code: &'static str) -> Self {
        self.error_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Audit entry consumer. Implementations must not fail the calling operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Default sink that forwards entries to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let identity = entry
            .identity_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let metadata = entry
            .metadata
            .map(|metadata| metadata.to_string())
            .unwrap_or_default();
        match entry.level {
            AuditLevel::Info => info!(
                action = entry.action,
                identity = %identity,
                metadata = %metadata,
                "{}",
                entry.message
            ),
            AuditLevel::Warn | AuditLevel::Security => warn!(
                action = entry.action,
                identity = %identity,
                error_code = entry.error_code.unwrap_or_default(),
                metadata = %metadata,
                "{}",
                entry.message
            ),
        }
    }
}
