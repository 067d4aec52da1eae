use chrono::Duration;

use super::SessionLimit;
use crate::AuthError;
use crate::crypto::{DEFAULT_TOKEN_BYTES, MAX_TOKEN_BYTES, MIN_TOKEN_BYTES};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a session from creation. Refresh issues a new full ttl.
    ///
    /// Default: 8 hours
    pub ttl: Duration,

    /// Concurrent active sessions allowed per user; 0 means unlimited.
    ///
    /// Default: 0
    pub max_sessions_per_user: u32,

    /// A new session invalidates every other active session of the user.
    ///
    /// Default: false
    pub force_single_session: bool,

    /// Reject validation from a different address than creation.
    ///
    /// Default: true
    pub bind_address: bool,

    /// Reject validation from a different client fingerprint than creation.
    ///
    /// Default: true
    pub bind_fingerprint: bool,

    /// Random bytes behind each session identifier.
    ///
    /// Default: 32
    pub token_bytes: usize,

    /// Random bytes behind each CSRF token.
    ///
    /// Default: 32
    pub csrf_token_bytes: usize,

    /// Interval of the background sweeper.
    ///
    /// Default: 5 minutes
    pub cleanup_interval: std::time::Duration,

    /// How long invalidated sessions are kept before being pruned.
    ///
    /// Default: 7 days
    pub invalidated_retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(8),
            max_sessions_per_user: 0,
            force_single_session: false,
            bind_address: true,
            bind_fingerprint: true,
            token_bytes: DEFAULT_TOKEN_BYTES,
            csrf_token_bytes: DEFAULT_TOKEN_BYTES,
            cleanup_interval: std::time::Duration::from_secs(300),
            invalidated_retention: Duration::days(7),
        }
    }
}

impl SessionConfig {
    /// Concurrency policy applied when a session is inserted.
    pub fn session_limit(&self) -> SessionLimit {
        if self.force_single_session {
            SessionLimit::Single
        } else if self.max_sessions_per_user == 0 {
            SessionLimit::Unlimited
        } else {
            SessionLimit::Max(self.max_sessions_per_user)
        }
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.ttl <= Duration::zero() {
            return Err(AuthError::ConfigurationError(
                "session ttl must be positive".to_owned(),
            ));
        }
        for (name, bytes) in [
            ("token_bytes", self.token_bytes),
            ("csrf_token_bytes", self.csrf_token_bytes),
        ] {
            if !(MIN_TOKEN_BYTES..=MAX_TOKEN_BYTES).contains(&bytes) {
                return Err(AuthError::ConfigurationError(format!(
                    "{name} must be between {MIN_TOKEN_BYTES} and {MAX_TOKEN_BYTES}"
                )));
            }
        }
        if self.cleanup_interval.is_zero() {
            return Err(AuthError::ConfigurationError(
                "cleanup_interval must be non-zero".to_owned(),
            ));
        }
        if self.invalidated_retention < Duration::zero() {
            return Err(AuthError::ConfigurationError(
                "invalidated_retention must not be negative".to_owned(),
            ));
        }
        Ok(())
    }
}
