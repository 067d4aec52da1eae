//! Security audit trail.
//!
//! Session and brute-force components report every security-relevant
//! decision to an [`AuditSink`]. Recording is best effort: a failing sink is
//! logged and never changes the outcome of the operation that reported it.
//!
//! ```rust
//! use custodia::audit::{AuditAction, AuditEntry, AuditSink, InMemoryAuditSink};
//!
//! # tokio_test_block_on(async {
//! let sink = InMemoryAuditSink::new();
//! sink.record(&AuditEntry::new(AuditAction::LoginFailed).target("alice")).await.unwrap();
//! assert_eq!(sink.entries()[0].action, AuditAction::LoginFailed);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AuthError, LOG_TARGET};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SessionCreated,
    SessionRefreshed,
    SessionInvalidated,
    SessionExpired,
    SessionEvicted,
    SecurityViolation,
    CsrfMismatch,
    LoginSucceeded,
    LoginFailed,
    AttemptBlocked,
    LockoutCreated,
    LockoutReleased,
    WhitelistChanged,
    RateLimitConfigChanged,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionRefreshed => "session_refreshed",
            Self::SessionInvalidated => "session_invalidated",
            Self::SessionExpired => "session_expired",
            Self::SessionEvicted => "session_evicted",
            Self::SecurityViolation => "security_violation",
            Self::CsrfMismatch => "csrf_mismatch",
            Self::LoginSucceeded => "login_succeeded",
            Self::LoginFailed => "login_failed",
            Self::AttemptBlocked => "attempt_blocked",
            Self::LockoutCreated => "lockout_created",
            Self::LockoutReleased => "lockout_released",
            Self::WhitelistChanged => "whitelist_changed",
            Self::RateLimitConfigChanged => "rate_limit_config_changed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
///
/// `target` names the affected object. Session identifiers are bearer
/// credentials and are only ever recorded through [`session_ref`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub actor_id: Option<i64>,
    pub target: Option<String>,
    pub address: Option<String>,
    pub details: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            actor_id: None,
            target: None,
            address: None,
            details: None,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: i64) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Reference to a session identifier for audit output: the first 16 hex
/// digits of its SHA-256. Stable per session, and reveals nothing of the token.
pub fn session_ref(session_id: &str) -> String {
    let digest = crate::crypto::hash_token(session_id);
    format!("sess:{}", &digest[..16])
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuthError>;
}

/// Records an entry, downgrading sink failures to a warning.
pub(crate) async fn emit(sink: &dyn AuditSink, entry: AuditEntry) {
    if let Err(e) = sink.record(&entry).await {
        log::warn!(
            target: LOG_TARGET,
            "msg=\"audit sink failed\", action={}, error={e}",
            entry.action
        );
    }
}

/// Writes audit entries through the `log` facade.
pub struct LoggingAuditSink {
    level: log::Level,
}

impl LoggingAuditSink {
    /// Logs at INFO level.
    pub fn new() -> Self {
        Self {
            level: log::Level::Info,
        }
    }

    pub fn with_level(level: log::Level) -> Self {
        Self { level }
    }
}

impl Default for LoggingAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for LoggingAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuthError> {
        log::log!(
            target: "custodia_auth::audit",
            self.level,
            "action={}, actor={:?}, target={:?}, address={:?}, details={:?}",
            entry.action,
            entry.actor_id,
            entry.target,
            entry.address,
            entry.details
        );
        Ok(())
    }
}

/// Keeps entries in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.entries
            .lock()
            .map(|e| e.iter().filter(|entry| entry.action == action).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuthError> {
        self.entries
            .lock()
            .map_err(|_| AuthError::Internal("Lock poisoned".to_owned()))?
            .push(entry.clone());
        Ok(())
    }
}
