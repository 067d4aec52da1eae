//! Authentication security core.
//!
//! `custodia` turns a verified credential into a bound, revocable session and
//! detects and throttles credential-guessing attacks.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`cipher`] | AES-256-GCM field encryption for columns at rest |
//! | [`crypto`] | Token generation, constant-time compare, password hashing |
//! | [`session`] | Session store backends and the [`SessionManager`](session::SessionManager) |
//! | [`rate_limit`] | Attempt and lockout ledgers and the [`RateLimitPolicy`](rate_limit::RateLimitPolicy) |
//! | [`audit`] | Best-effort audit sink |
//! | [`actions`] | The authenticate flow wiring everything together |
//!
//! Enable `sqlx_sqlite` for the encrypted relational backend, `tracing` for
//! span instrumentation and `mocks` for test doubles.

pub mod actions;
pub mod audit;
pub mod cipher;
pub mod config;
pub mod crypto;
pub mod rate_limit;
mod secret;
pub mod session;
mod sweeper;

#[cfg(feature = "sqlx_sqlite")]
pub mod sqlite;

pub use audit::{AuditAction, AuditEntry, AuditSink, InMemoryAuditSink, LoggingAuditSink};
pub use cipher::{EncryptionKey, FieldCipher, KeySource};
pub use config::{CustodiaConfig, LockoutScope, RateLimitConfig};
pub use rate_limit::{AccountLockout, Admission, LockoutKind, LoginAttempt, RateLimitPolicy};
pub use secret::{SecretBytes, SecretString};
pub use sweeper::SweeperHandle;
pub use session::{
    InvalidationReason, RequestContext, Session, SessionConfig, SessionManager, SessionState,
    SessionStore,
};

use std::fmt;

/// Log target used for every line this crate emits.
pub(crate) const LOG_TARGET: &str = "custodia_auth";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown, malformed or already-invalidated session identifier.
    InvalidSession,
    SessionExpired,
    AddressMismatch,
    FingerprintMismatch,
    InvalidCsrfToken,
    /// Ciphertext failed authentication or was truncated. Never swallowed.
    DecryptionFailed,
    /// `retry_after_secs` is `None` for indefinite (manual) lockouts.
    RateLimited {
        retry_after_secs: Option<i64>,
    },
    /// Deliberately does not distinguish unknown identity from wrong password.
    InvalidCredentials,
    /// A freshly generated identifier already exists in the store.
    IdentifierCollision,
    PasswordHashError,
    DatabaseError(String),
    ConfigurationError(String),
    Internal(String),
}

impl AuthError {
    /// Storage failure prefixed with the operation that hit it.
    pub(crate) fn storage(operation: &str, cause: impl fmt::Display) -> Self {
        Self::DatabaseError(format!("{operation}: {cause}"))
    }

    /// Returns true for failures of the credential check itself, including throttling.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials | Self::RateLimited { .. } | Self::PasswordHashError
        )
    }

    /// Returns true for failures that invalidate the session they were raised on.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::AddressMismatch | Self::FingerprintMismatch | Self::InvalidCsrfToken
        )
    }

    /// Text safe to show an unauthenticated caller.
    ///
    /// Lockout state and remaining wait time never leak through this message.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials | Self::RateLimited { .. } | Self::PasswordHashError => {
                "authentication failed"
            }
            Self::InvalidSession
            | Self::SessionExpired
            | Self::AddressMismatch
            | Self::FingerprintMismatch
            | Self::InvalidCsrfToken => "session invalid",
            Self::DecryptionFailed
            | Self::IdentifierCollision
            | Self::DatabaseError(_)
            | Self::ConfigurationError(_)
            | Self::Internal(_) => "internal error",
        }
    }
}

impl std::error::Error for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSession => write!(f, "Invalid session"),
            Self::SessionExpired => write!(f, "Session has expired"),
            Self::AddressMismatch => write!(f, "Session address mismatch"),
            Self::FingerprintMismatch => write!(f, "Session fingerprint mismatch"),
            Self::InvalidCsrfToken => write!(f, "Invalid CSRF token"),
            Self::DecryptionFailed => write!(f, "Decryption failed"),
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "Too many attempts, retry after {secs}s"),
            Self::RateLimited {
                retry_after_secs: None,
            } => write!(f, "Too many attempts, locked until manually released"),
            Self::InvalidCredentials => write!(f, "Invalid credentials"),
            Self::IdentifierCollision => write!(f, "Generated identifier already exists"),
            Self::PasswordHashError => write!(f, "Failed to verify password hash"),
            Self::DatabaseError(msg) => write!(f, "Database error: {msg}"),
            Self::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}
