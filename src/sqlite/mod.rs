//! `SQLite` storage backend.
//!
//! Durable implementations of every storage trait in the crate. Enable the
//! `sqlx_sqlite` feature to use them, and run [`migrations::run`] once at
//! startup.
//!
//! Session role, address and fingerprint are encrypted at rest with the
//! [`FieldCipher`](crate::FieldCipher) handed to [`SqliteSessionStore`].

mod attempt_ledger;
mod lockout_ledger;
pub mod migrations;
mod rate_limit_config;
mod session_store;

pub use attempt_ledger::SqliteAttemptLedger;
pub use lockout_ledger::SqliteLockoutLedger;
pub use rate_limit_config::SqliteRateLimitConfigRepository;
pub use session_store::SqliteSessionStore;
use sqlx::SqlitePool;

use crate::{AuthError, FieldCipher, LOG_TARGET};

/// Creates every `SQLite` repository from one connection pool.
pub fn create_repositories(
    pool: SqlitePool,
    cipher: FieldCipher,
) -> (
    SqliteSessionStore,
    SqliteAttemptLedger,
    SqliteLockoutLedger,
    SqliteRateLimitConfigRepository,
) {
    (
        SqliteSessionStore::new(pool.clone(), cipher),
        SqliteAttemptLedger::new(pool.clone()),
        SqliteLockoutLedger::new(pool.clone()),
        SqliteRateLimitConfigRepository::new(pool),
    )
}

fn db_error(operation: &str, e: &sqlx::Error) -> AuthError {
    log::error!(
        target: LOG_TARGET,
        "msg=\"database error\", operation=\"{operation}\", error=\"{e}\""
    );
    AuthError::storage(operation, e)
}
