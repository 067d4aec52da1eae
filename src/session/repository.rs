//! Session store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{InvalidationReason, Session};
use crate::AuthError;

/// How many concurrent active sessions a user may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLimit {
    Unlimited,
    /// Oldest active sessions are evicted to make room for the new one.
    Max(u32),
    /// Every other active session of the user is invalidated.
    Single,
}

/// Storage for sessions.
///
/// Every mutating operation is atomic with respect to concurrent callers:
/// - [`InMemorySessionStore`](super::InMemorySessionStore): process-local
/// - `SqliteSessionStore`: durable, with sensitive columns encrypted
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new active session, enforcing `limit` for its user in the
    /// same atomic step.
    ///
    /// Returns the identifiers of sessions invalidated to honour the limit.
    /// Fails with `IdentifierCollision` if the identifier already exists.
    async fn insert(
        &self,
        session: &Session,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError>;

    async fn find(&self, session_id: &str) -> Result<Option<Session>, AuthError>;

    /// Records activity. Returns false if the session is no longer active.
    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool, AuthError>;

    /// Marks an active session invalidated.
    ///
    /// Returns false if it was already inactive or does not exist, in which
    /// case the stored reason is left untouched.
    async fn invalidate(
        &self,
        session_id: &str,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError>;

    /// Invalidates `old_id` with reason `Refreshed` and inserts `replacement`
    /// in one step. Returns false, with nothing written, if `old_id` was no
    /// longer active.
    async fn rotate(
        &self,
        old_id: &str,
        replacement: &Session,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError>;

    /// Returns the identifiers invalidated.
    async fn invalidate_user_sessions(
        &self,
        user_id: i64,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError>;

    /// Active, unexpired sessions of a user, oldest first.
    async fn active_sessions_for_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError>;

    /// Invalidates every active session past its expiry with reason `Expired`.
    ///
    /// Returns the number of sessions transitioned.
    async fn invalidate_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;

    /// Deletes sessions invalidated before `before`.
    async fn prune_invalidated(&self, before: DateTime<Utc>) -> Result<u64, AuthError>;
}
