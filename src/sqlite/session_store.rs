use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use super::db_error;
use crate::SecretString;
use crate::cipher::FieldCipher;
use crate::session::{InvalidationReason, Session, SessionLimit, SessionStore};
use crate::{AuthError, LOG_TARGET};

/// Durable session store.
///
/// Role, address and fingerprint are encrypted with the supplied
/// [`FieldCipher`]; a row that fails to decrypt surfaces as
/// `AuthError::DecryptionFailed` and is never returned half-read.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    cipher: FieldCipher,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool, cipher: FieldCipher) -> Self {
        Self { pool, cipher }
    }

    async fn insert_row(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        session: &Session,
        operation: &str,
    ) -> Result<(), AuthError> {
        let role = self.cipher.encrypt_str(&session.role)?;
        let address = self.cipher.encrypt_str(&session.address)?;
        let fingerprint = self.cipher.encrypt_str(&session.fingerprint)?;

        sqlx::query(
            r"INSERT INTO sessions (id, user_id, role_cipher, address_cipher, fingerprint_cipher,
                                    csrf_token, created_at, expires_at, last_accessed_at, is_active)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(session.id.expose_secret())
        .bind(session.user_id)
        .bind(role)
        .bind(address)
        .bind(fingerprint)
        .bind(session.csrf_token.expose_secret())
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.last_accessed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                log::warn!(target: LOG_TARGET, "msg=\"session identifier collision\", operation=\"{operation}\"");
                AuthError::IdentifierCollision
            }
            _ => db_error(operation, &e),
        })?;

        Ok(())
    }
}

#[derive(FromRow)]
struct SessionRecord {
    id: String,
    user_id: i64,
    role_cipher: Vec<u8>,
    address_cipher: Vec<u8>,
    fingerprint_cipher: Vec<u8>,
    csrf_token: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    is_active: bool,
    invalidation_reason: Option<String>,
    invalidated_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Decrypted columns are copied into the session's plain fields; the
    /// intermediate buffers are wiped.
    fn into_session(self, cipher: &FieldCipher) -> Result<Session, AuthError> {
        let decrypted = cipher.decrypt_str(&self.role_cipher).and_then(|role| {
            Ok((
                role,
                cipher.decrypt_str(&self.address_cipher)?,
                cipher.decrypt_str(&self.fingerprint_cipher)?,
            ))
        });
        let (role, address, fingerprint) = decrypted.inspect_err(|_| {
            log::error!(
                target: LOG_TARGET,
                "msg=\"session row unreadable\", user_id={}",
                self.user_id
            );
        })?;

        Ok(Session {
            id: SecretString::new(self.id),
            user_id: self.user_id,
            role: role.expose_secret().to_owned(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed_at: self.last_accessed_at,
            address: address.expose_secret().to_owned(),
            fingerprint: fingerprint.expose_secret().to_owned(),
            csrf_token: SecretString::new(self.csrf_token),
            is_active: self.is_active,
            invalidation_reason: self.invalidation_reason.map(InvalidationReason::from),
            invalidated_at: self.invalidated_at,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, session), err))]
    async fn insert(
        &self,
        session: &Session,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError> {
        // sessions ranked newest first; everything at or past `cutoff` goes
        let eviction = match limit {
            SessionLimit::Unlimited => None,
            SessionLimit::Single => Some((1_u32, InvalidationReason::SingleSession)),
            SessionLimit::Max(max) => Some((max.max(1), InvalidationReason::LimitExceeded)),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("insert_session", &e))?;

        let evicted: Vec<String> = match eviction {
            None => Vec::new(),
            Some((cutoff, reason)) => sqlx::query_scalar(
                r"UPDATE sessions
                   SET is_active = 0, invalidation_reason = ?, invalidated_at = ?
                   WHERE id IN (
                       SELECT id FROM (
                           SELECT id, ROW_NUMBER() OVER (ORDER BY created_at DESC, rowid DESC) AS position
                           FROM sessions
                           WHERE user_id = ? AND is_active = 1 AND expires_at >= ?
                       )
                       WHERE position >= ?
                   )
                   RETURNING id",
            )
            .bind(reason.as_str())
            .bind(now)
            .bind(session.user_id)
            .bind(now)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_error("evict_sessions", &e))?,
        };

        self.insert_row(&mut tx, session, "insert_session").await?;

        tx.commit()
            .await
            .map_err(|e| db_error("insert_session", &e))?;

        Ok(evicted)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, err))]
    async fn find(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        let row: Option<SessionRecord> = sqlx::query_as(
            r"SELECT id, user_id, role_cipher, address_cipher, fingerprint_cipher, csrf_token,
                     created_at, expires_at, last_accessed_at, is_active,
                     invalidation_reason, invalidated_at
               FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find_session", &e))?;

        row.map(|r| r.into_session(&self.cipher)).transpose()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, session_id), err))]
    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool, AuthError> {
        let result =
            sqlx::query("UPDATE sessions SET last_accessed_at = ? WHERE id = ? AND is_active = 1")
                .bind(at)
                .bind(session_id)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("touch_session", &e))?;

        Ok(result.rows_affected() > 0)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, session_id), err))]
    async fn invalidate(
        &self,
        session_id: &str,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let result = sqlx::query(
            r"UPDATE sessions
               SET is_active = 0, invalidation_reason = ?, invalidated_at = ?
               WHERE id = ? AND is_active = 1",
        )
        .bind(reason.as_str())
        .bind(at)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("invalidate_session", &e))?;

        Ok(result.rows_affected() > 0)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, old_id, replacement), err))]
    async fn rotate(
        &self,
        old_id: &str,
        replacement: &Session,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("rotate_session", &e))?;

        let result = sqlx::query(
            r"UPDATE sessions
               SET is_active = 0, invalidation_reason = ?, invalidated_at = ?
               WHERE id = ? AND is_active = 1",
        )
        .bind(InvalidationReason::Refreshed.as_str())
        .bind(at)
        .bind(old_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("rotate_session", &e))?;

        // lost the race; dropping the transaction rolls back
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.insert_row(&mut tx, replacement, "rotate_session").await?;

        tx.commit()
            .await
            .map_err(|e| db_error("rotate_session", &e))?;

        Ok(true)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn invalidate_user_sessions(
        &self,
        user_id: i64,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError> {
        sqlx::query_scalar(
            r"UPDATE sessions
               SET is_active = 0, invalidation_reason = ?, invalidated_at = ?
               WHERE user_id = ? AND is_active = 1
               RETURNING id",
        )
        .bind(reason.as_str())
        .bind(at)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("invalidate_user_sessions", &e))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn active_sessions_for_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError> {
        let rows: Vec<SessionRecord> = sqlx::query_as(
            r"SELECT id, user_id, role_cipher, address_cipher, fingerprint_cipher, csrf_token,
                     created_at, expires_at, last_accessed_at, is_active,
                     invalidation_reason, invalidated_at
               FROM sessions
               WHERE user_id = ? AND is_active = 1 AND expires_at >= ?
               ORDER BY created_at ASC, rowid ASC",
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("active_sessions_for_user", &e))?;

        rows.into_iter()
            .map(|r| r.into_session(&self.cipher))
            .collect()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn invalidate_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let result = sqlx::query(
            r"UPDATE sessions
               SET is_active = 0, invalidation_reason = ?, invalidated_at = ?
               WHERE is_active = 1 AND expires_at < ?",
        )
        .bind(InvalidationReason::Expired.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("invalidate_expired_sessions", &e))?;

        Ok(result.rows_affected())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn prune_invalidated(&self, before: DateTime<Utc>) -> Result<u64, AuthError> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE is_active = 0 AND invalidated_at < ?")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("prune_invalidated_sessions", &e))?;

        Ok(result.rows_affected())
    }
}
