use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::db_error;
use crate::AuthError;
use crate::rate_limit::{AttemptLedger, LoginAttempt};

#[derive(Clone)]
pub struct SqliteAttemptLedger {
    pool: SqlitePool,
}

impl SqliteAttemptLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct AttemptRecord {
    id: i64,
    address: String,
    identity: String,
    success: bool,
    attempted_at: DateTime<Utc>,
    fingerprint: String,
}

impl From<AttemptRecord> for LoginAttempt {
    fn from(r: AttemptRecord) -> Self {
        Self {
            id: r.id,
            address: r.address,
            identity: r.identity,
            success: r.success,
            attempted_at: r.attempted_at,
            fingerprint: r.fingerprint,
        }
    }
}

fn to_count(n: i64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[async_trait]
impl AttemptLedger for SqliteAttemptLedger {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity, fingerprint), err))]
    async fn record(
        &self,
        identity: &str,
        address: &str,
        fingerprint: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<LoginAttempt, AuthError> {
        let row: AttemptRecord = sqlx::query_as(
            r"INSERT INTO login_attempts (address, identity, success, attempted_at, fingerprint)
               VALUES (?, ?, ?, ?, ?)
               RETURNING id, address, identity, success, attempted_at, fingerprint",
        )
        .bind(address)
        .bind(identity)
        .bind(success)
        .bind(at)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("record_attempt", &e))?;

        Ok(row.into())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn count_failures_for_identity(
        &self,
        identity: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, AuthError> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM login_attempts
               WHERE identity = ? AND success = 0 AND attempted_at >= ?",
        )
        .bind(identity)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count_failures_for_identity", &e))?;

        Ok(to_count(count))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn count_failures_for_address(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, AuthError> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM login_attempts
               WHERE address = ? AND success = 0 AND attempted_at >= ?",
        )
        .bind(address)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count_failures_for_address", &e))?;

        Ok(to_count(count))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn last_success_for_identity(
        &self,
        identity: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        sqlx::query_scalar(
            r"SELECT attempted_at FROM login_attempts
               WHERE identity = ? AND success = 1
               ORDER BY attempted_at DESC LIMIT 1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("last_success_for_identity", &e))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, identity), err))]
    async fn recent_for_identity(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<LoginAttempt>, AuthError> {
        let rows: Vec<AttemptRecord> = sqlx::query_as(
            r"SELECT id, address, identity, success, attempted_at, fingerprint
               FROM login_attempts
               WHERE identity = ?
               ORDER BY attempted_at DESC, id DESC
               LIMIT ?",
        )
        .bind(identity)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("recent_attempts_for_identity", &e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE attempted_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("prune_login_attempts", &e))?;

        Ok(result.rows_affected())
    }
}
