//! Configuration types.
//!
//! # Example
//!
//! ```rust
//! use custodia::config::{CustodiaConfig, RateLimitConfig};
//! use chrono::Duration;
//!
//! let config = CustodiaConfig {
//!     rate_limit: RateLimitConfig {
//!         max_attempts_per_identity: 3,
//!         base_lockout: Duration::minutes(30),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::collections::BTreeSet;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::AuthError;
use crate::session::SessionConfig;

/// Top-level configuration for the authentication core.
#[derive(Debug, Clone, Default)]
pub struct CustodiaConfig {
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
}

impl CustodiaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Long sessions, lenient lockouts, no client binding.
    pub fn development() -> Self {
        Self {
            session: SessionConfig {
                ttl: Duration::hours(24),
                bind_address: false,
                bind_fingerprint: false,
                ..Default::default()
            },
            rate_limit: RateLimitConfig {
                max_attempts_per_identity: 20,
                max_attempts_per_address: 100,
                base_lockout: Duration::minutes(1),
                progressive: false,
                ..Default::default()
            },
        }
    }

    /// Short single sessions, strict lockouts with steep backoff.
    pub fn strict() -> Self {
        Self {
            session: SessionConfig {
                ttl: Duration::minutes(30),
                force_single_session: true,
                max_sessions_per_user: 1,
                bind_address: true,
                bind_fingerprint: true,
                token_bytes: 48,
                ..Default::default()
            },
            rate_limit: RateLimitConfig {
                max_attempts_per_identity: 3,
                max_attempts_per_address: 10,
                base_lockout: Duration::minutes(30),
                backoff_multiplier: 3.0,
                max_lockout: Duration::days(7),
                ..Default::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        self.session.validate()?;
        self.rate_limit.validate()
    }
}

/// Which keys a threshold breach locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockoutScope {
    Identity,
    Address,
    #[default]
    Both,
}

impl LockoutScope {
    pub fn covers_identity(self) -> bool {
        matches!(self, Self::Identity | Self::Both)
    }

    pub fn covers_address(self) -> bool {
        matches!(self, Self::Address | Self::Both)
    }
}

/// Brute-force defense policy.
///
/// Persisted as a single row (see `RateLimitConfigRepository`) and read on
/// every admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Failed attempts from one address within `window` before it is locked.
    ///
    /// Default: 20
    pub max_attempts_per_address: u32,

    /// Failed attempts against one identity within `window` before it is locked.
    ///
    /// Default: 5
    pub max_attempts_per_identity: u32,

    /// Sliding window over which failures are counted.
    ///
    /// Default: 15 minutes
    #[serde(with = "duration_secs")]
    pub window: Duration,

    /// Duration of a first lockout.
    ///
    /// Default: 15 minutes
    #[serde(with = "duration_secs")]
    pub base_lockout: Duration,

    /// Each further lockout of the same key lasts `multiplier` times longer.
    ///
    /// Default: 2.0
    pub backoff_multiplier: f64,

    /// Ceiling for progressive lockouts.
    ///
    /// Default: 24 hours
    #[serde(with = "duration_secs")]
    pub max_lockout: Duration,

    /// Addresses that bypass all counting and lockout logic.
    pub whitelist: BTreeSet<String>,

    /// When false every lockout lasts `base_lockout`.
    ///
    /// Default: true
    pub progressive: bool,

    pub lockout_scope: LockoutScope,

    /// Attempt records older than this are removed by the retention sweep.
    ///
    /// Default: 90 days
    #[serde(with = "duration_secs")]
    pub attempt_retention: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_address: 20,
            max_attempts_per_identity: 5,
            window: Duration::minutes(15),
            base_lockout: Duration::minutes(15),
            backoff_multiplier: 2.0,
            max_lockout: Duration::hours(24),
            whitelist: BTreeSet::new(),
            progressive: true,
            lockout_scope: LockoutScope::Both,
            attempt_retention: Duration::days(90),
        }
    }
}

impl RateLimitConfig {
    pub fn is_whitelisted(&self, address: &str) -> bool {
        self.whitelist.contains(address)
    }

    /// Lockout duration after `prior_lockouts` earlier lockouts of the same key.
    ///
    /// `base * multiplier^prior`, capped at `max_lockout`.
    pub fn lockout_duration(&self, prior_lockouts: u32) -> Duration {
        if !self.progressive || prior_lockouts == 0 {
            return self.base_lockout.min(self.max_lockout);
        }

        let exponent = i32::try_from(prior_lockouts).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let secs = self.base_lockout.num_seconds() as f64 * factor;
        let ceiling = self.max_lockout.num_seconds();

        if !secs.is_finite() || secs >= ceiling as f64 {
            return self.max_lockout;
        }
        Duration::seconds(secs.round() as i64)
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.max_attempts_per_identity == 0 || self.max_attempts_per_address == 0 {
            return Err(AuthError::ConfigurationError(
                "attempt thresholds must be at least 1".to_owned(),
            ));
        }
        if self.window <= Duration::zero() {
            return Err(AuthError::ConfigurationError(
                "window must be positive".to_owned(),
            ));
        }
        if self.base_lockout <= Duration::zero() || self.max_lockout < self.base_lockout {
            return Err(AuthError::ConfigurationError(
                "lockout durations must be positive with max_lockout >= base_lockout".to_owned(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(AuthError::ConfigurationError(
                "backoff_multiplier must be >= 1.0".to_owned(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = i64::deserialize(deserializer)?;
        Duration::try_seconds(secs).ok_or_else(|| serde::de::Error::custom("duration out of range"))
    }
}
