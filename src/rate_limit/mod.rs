//! Brute-force defense.
//!
//! Every attempt is appended to an [`AttemptLedger`]; the [`RateLimitPolicy`]
//! counts recent failures per identity and per address before each attempt and
//! places an [`AccountLockout`] in the [`LockoutLedger`] once a threshold is
//! reached. Repeat offenders get progressively longer lockouts.

mod attempts;
mod config_store;
mod lockout;
mod policy;

pub use attempts::{AttemptLedger, InMemoryAttemptLedger, LoginAttempt};
pub use config_store::{InMemoryRateLimitConfigRepository, RateLimitConfigRepository};
pub use lockout::{
    AccountLockout, InMemoryLockoutLedger, LockoutCreation, LockoutKind, LockoutLedger, NewLockout,
};
pub use policy::{Admission, RateLimitPolicy, RateLimitSweepResult};
