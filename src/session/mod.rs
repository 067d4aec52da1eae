//! Session lifecycle.
//!
//! A session moves `Active -> Expired -> Invalidated` and never back. Expiry is
//! detected lazily on validation (and opportunistically by the sweeper);
//! invalidation is terminal and a refresh always mints a new identifier.

mod config;
mod manager;
mod memory_store;
mod repository;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SecretString;

pub use config::SessionConfig;
pub use manager::{SessionManager, SweepResult};
pub use memory_store::InMemorySessionStore;
pub use repository::{SessionLimit, SessionStore};

/// Value used for request metadata the caller could not supply.
pub const UNKNOWN: &str = "unknown";

/// Originating address and client fingerprint of a request.
///
/// Passed explicitly into every session-affecting call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub address: String,
    pub fingerprint: String,
}

impl RequestContext {
    /// Missing or blank values become `"unknown"`.
    pub fn new(address: Option<&str>, fingerprint: Option<&str>) -> Self {
        fn or_unknown(value: Option<&str>) -> String {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(UNKNOWN)
                .to_owned()
        }

        Self {
            address: or_unknown(address),
            fingerprint: or_unknown(fingerprint),
        }
    }

    pub fn unknown() -> Self {
        Self::new(None, None)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::unknown()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum InvalidationReason {
    Logout,
    Expired,
    SecurityViolation,
    Refreshed,
    LimitExceeded,
    SingleSession,
    Revoked,
    Custom(String),
}

impl InvalidationReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Logout => "logout",
            Self::Expired => "expired",
            Self::SecurityViolation => "security_violation",
            Self::Refreshed => "refreshed",
            Self::LimitExceeded => "limit_exceeded",
            Self::SingleSession => "single_session",
            Self::Revoked => "revoked",
            Self::Custom(reason) => reason,
        }
    }
}

impl From<&str> for InvalidationReason {
    fn from(value: &str) -> Self {
        match value {
            "logout" => Self::Logout,
            "expired" => Self::Expired,
            "security_violation" => Self::SecurityViolation,
            "refreshed" => Self::Refreshed,
            "limit_exceeded" => Self::LimitExceeded,
            "single_session" => Self::SingleSession,
            "revoked" => Self::Revoked,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl From<String> for InvalidationReason {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<InvalidationReason> for String {
    fn from(value: InvalidationReason) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
    Invalidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SecretString,
    pub user_id: i64,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub address: String,
    pub fingerprint: String,
    pub csrf_token: SecretString,
    pub is_active: bool,
    pub invalidation_reason: Option<InvalidationReason>,
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if !self.is_active {
            SessionState::Invalidated
        } else if now > self.expires_at {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }

    pub fn state(&self) -> SessionState {
        self.state_at(Utc::now())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}
