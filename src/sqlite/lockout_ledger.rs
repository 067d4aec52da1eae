use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::db_error;
use crate::rate_limit::{AccountLockout, LockoutCreation, LockoutLedger, NewLockout};
use crate::{AuthError, LOG_TARGET};

/// Attempts at placing a lockout before giving up. Only reached when a
/// conflicting lockout is released between the insert and the lookup.
const MAX_CREATE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct SqliteLockoutLedger {
    pool: SqlitePool,
}

impl SqliteLockoutLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find_active_covering(
        &self,
        lockout: &NewLockout,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError> {
        let row: Option<LockoutRecord> = sqlx::query_as(
            r"SELECT id, identity, address, kind, locked_at, unlocked_at, reason,
                     failure_count, duration_seconds, expires_at, carried_from
               FROM account_lockouts
               WHERE unlocked_at IS NULL AND (expires_at IS NULL OR expires_at > ?)
                 AND (identity = ? OR address = ?)
               ORDER BY locked_at DESC, id DESC
               LIMIT 1",
        )
        .bind(now)
        .bind(lockout.identity.as_deref())
        .bind(lockout.address.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find_covering_lockout", &e))?;

        row.map(LockoutRecord::into_lockout).transpose()
    }
}

#[derive(FromRow)]
struct LockoutRecord {
    id: i64,
    identity: Option<String>,
    address: Option<String>,
    kind: String,
    locked_at: DateTime<Utc>,
    unlocked_at: Option<DateTime<Utc>>,
    reason: String,
    failure_count: i64,
    duration_seconds: i64,
    expires_at: Option<DateTime<Utc>>,
    carried_from: Option<i64>,
}

impl LockoutRecord {
    fn into_lockout(self) -> Result<AccountLockout, AuthError> {
        Ok(AccountLockout {
            id: self.id,
            identity: self.identity,
            address: self.address,
            kind: self.kind.parse()?,
            locked_at: self.locked_at,
            unlocked_at: self.unlocked_at,
            reason: self.reason,
            failure_count: u32::try_from(self.failure_count).unwrap_or(u32::MAX),
            duration_seconds: self.duration_seconds,
            expires_at: self.expires_at,
            carried_from: self.carried_from,
        })
    }
}

#[async_trait]
impl LockoutLedger for SqliteLockoutLedger {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, lockout), err))]
    async fn create_if_absent(
        &self,
        lockout: &NewLockout,
        now: DateTime<Utc>,
    ) -> Result<LockoutCreation, AuthError> {
        let candidate = lockout.clone().into_lockout(0, now);

        for _ in 0..MAX_CREATE_ATTEMPTS {
            // check and insert in one statement
            let id: Option<i64> = sqlx::query_scalar(
                r"INSERT INTO account_lockouts (identity, address, kind, locked_at, reason,
                                                failure_count, duration_seconds, expires_at,
                                                carried_from)
                   SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
                   WHERE NOT EXISTS (
                       SELECT 1 FROM account_lockouts
                       WHERE unlocked_at IS NULL AND (expires_at IS NULL OR expires_at > ?)
                         AND (identity = ? OR address = ?)
                   )
                   RETURNING id",
            )
            .bind(candidate.identity.as_deref())
            .bind(candidate.address.as_deref())
            .bind(candidate.kind.as_str())
            .bind(candidate.locked_at)
            .bind(&candidate.reason)
            .bind(candidate.failure_count)
            .bind(candidate.duration_seconds)
            .bind(candidate.expires_at)
            .bind(candidate.carried_from)
            .bind(now)
            .bind(candidate.identity.as_deref())
            .bind(candidate.address.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("create_lockout", &e))?;

            if let Some(id) = id {
                return Ok(LockoutCreation::Created(AccountLockout {
                    id,
                    ..candidate
                }));
            }

            if let Some(existing) = self.find_active_covering(lockout, now).await? {
                return Ok(LockoutCreation::Existing(existing));
            }
        }

        log::error!(target: LOG_TARGET, "msg=\"lockout placement kept conflicting\"");
        Err(AuthError::storage(
            "create_lockout",
            "placement kept conflicting",
        ))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn find_active_for_identity(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError> {
        let row: Option<LockoutRecord> = sqlx::query_as(
            r"SELECT id, identity, address, kind, locked_at, unlocked_at, reason,
                     failure_count, duration_seconds, expires_at, carried_from
               FROM account_lockouts
               WHERE identity = ? AND unlocked_at IS NULL
                 AND (expires_at IS NULL OR expires_at > ?)
               ORDER BY locked_at DESC, id DESC
               LIMIT 1",
        )
        .bind(identity)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find_active_lockout_for_identity", &e))?;

        row.map(LockoutRecord::into_lockout).transpose()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn find_active_for_address(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError> {
        let row: Option<LockoutRecord> = sqlx::query_as(
            r"SELECT id, identity, address, kind, locked_at, unlocked_at, reason,
                     failure_count, duration_seconds, expires_at, carried_from
               FROM account_lockouts
               WHERE address = ? AND unlocked_at IS NULL
                 AND (expires_at IS NULL OR expires_at > ?)
               ORDER BY locked_at DESC, id DESC
               LIMIT 1",
        )
        .bind(address)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find_active_lockout_for_address", &e))?;

        row.map(LockoutRecord::into_lockout).transpose()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn latest_locked_at_for_identity(
        &self,
        identity: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        sqlx::query_scalar(
            r"SELECT locked_at FROM account_lockouts
               WHERE identity = ?
               ORDER BY locked_at DESC LIMIT 1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("latest_lockout_for_identity", &e))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn latest_locked_at_for_address(
        &self,
        address: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        sqlx::query_scalar(
            r"SELECT locked_at FROM account_lockouts
               WHERE address = ?
               ORDER BY locked_at DESC LIMIT 1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("latest_lockout_for_address", &e))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn count_for_identity(&self, identity: &str) -> Result<u32, AuthError> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM account_lockouts
               WHERE identity = ? AND kind != 'manual' AND carried_from IS NULL",
        )
        .bind(identity)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count_lockouts_for_identity", &e))?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn count_for_address(&self, address: &str) -> Result<u32, AuthError> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM account_lockouts
               WHERE address = ? AND kind != 'manual' AND carried_from IS NULL",
        )
        .bind(address)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count_lockouts_for_address", &e))?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn unlock(&self, id: i64, at: DateTime<Utc>) -> Result<bool, AuthError> {
        let result = sqlx::query(
            r"UPDATE account_lockouts SET unlocked_at = ?
               WHERE id = ? AND unlocked_at IS NULL
                 AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(at)
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("unlock_lockout", &e))?;

        Ok(result.rows_affected() > 0)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn unlock_identity(
        &self,
        identity: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AccountLockout>, AuthError> {
        let rows: Vec<LockoutRecord> = sqlx::query_as(
            r"UPDATE account_lockouts SET unlocked_at = ?
               WHERE identity = ? AND unlocked_at IS NULL
                 AND (expires_at IS NULL OR expires_at > ?)
               RETURNING id, identity, address, kind, locked_at, unlocked_at, reason,
                         failure_count, duration_seconds, expires_at, carried_from",
        )
        .bind(at)
        .bind(identity)
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("unlock_identity", &e))?;

        rows.into_iter().map(LockoutRecord::into_lockout).collect()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn unlock_address(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AccountLockout>, AuthError> {
        let rows: Vec<LockoutRecord> = sqlx::query_as(
            r"UPDATE account_lockouts SET unlocked_at = ?
               WHERE address = ? AND unlocked_at IS NULL
                 AND (expires_at IS NULL OR expires_at > ?)
               RETURNING id, identity, address, kind, locked_at, unlocked_at, reason,
                         failure_count, duration_seconds, expires_at, carried_from",
        )
        .bind(at)
        .bind(address)
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("unlock_address", &e))?;

        rows.into_iter().map(LockoutRecord::into_lockout).collect()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn expire_elapsed(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let result = sqlx::query(
            r"UPDATE account_lockouts SET unlocked_at = expires_at
               WHERE unlocked_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("expire_elapsed_lockouts", &e))?;

        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn history_for_identity(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<AccountLockout>, AuthError> {
        let rows: Vec<LockoutRecord> = sqlx::query_as(
            r"SELECT id, identity, address, kind, locked_at, unlocked_at, reason,
                     failure_count, duration_seconds, expires_at, carried_from
               FROM account_lockouts
               WHERE identity = ?
               ORDER BY locked_at DESC, id DESC
               LIMIT ?",
        )
        .bind(identity)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("lockout_history", &e))?;

        rows.into_iter().map(LockoutRecord::into_lockout).collect()
    }
}
