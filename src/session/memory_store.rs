//! In-memory session storage.
//!
//! Suitable for development, testing, and single-instance deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::repository::{SessionLimit, SessionStore};
use super::{InvalidationReason, Session};
use crate::AuthError;

struct Stored {
    /// Insertion order, breaks ties between equal `created_at` values.
    seq: u64,
    session: Session,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Stored>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, session: &Session) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.sessions.insert(
            session.id.expose_secret().to_owned(),
            Stored {
                seq,
                session: session.clone(),
            },
        );
    }

    /// Active, unexpired sessions of `user_id` ordered oldest first.
    fn live_for_user(&self, user_id: i64, now: DateTime<Utc>) -> Vec<(&String, &Stored)> {
        let mut live: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.session.user_id == user_id && s.session.is_active && s.session.expires_at >= now
            })
            .collect();
        live.sort_by_key(|(_, s)| (s.session.created_at, s.seq));
        live
    }

    fn invalidate(&mut self, id: &str, reason: &InvalidationReason, at: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(id) {
            Some(stored) if stored.session.is_active => {
                stored.session.is_active = false;
                stored.session.invalidation_reason = Some(reason.clone());
                stored.session.invalidated_at = Some(at);
                true
            }
            _ => false,
        }
    }
}

/// In-memory session storage.
///
/// Stores sessions in a `HashMap` protected by a `RwLock`. Every mutation
/// happens under the write lock, which makes limit enforcement and rotation
/// atomic.
///
/// # Note
///
/// Sessions are lost when the process restarts.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sessions stored, including invalidated ones.
    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, operation: &str) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, AuthError> {
        self.inner
            .write()
            .map_err(|_| AuthError::storage(operation, "lock poisoned"))
    }

    fn read(&self, operation: &str) -> Result<std::sync::RwLockReadGuard<'_, Inner>, AuthError> {
        self.inner
            .read()
            .map_err(|_| AuthError::storage(operation, "lock poisoned"))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(
        &self,
        session: &Session,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError> {
        let mut inner = self.write("insert_session")?;

        if inner.sessions.contains_key(session.id.expose_secret()) {
            return Err(AuthError::IdentifierCollision);
        }

        let (evict, reason): (Vec<String>, _) = {
            let live = inner.live_for_user(session.user_id, now);
            match limit {
                SessionLimit::Unlimited => (Vec::new(), InvalidationReason::LimitExceeded),
                SessionLimit::Single => (
                    live.iter().map(|(id, _)| (*id).clone()).collect(),
                    InvalidationReason::SingleSession,
                ),
                SessionLimit::Max(max) => {
                    let excess = (live.len() + 1).saturating_sub(max.max(1) as usize);
                    (
                        live.iter().take(excess).map(|(id, _)| (*id).clone()).collect(),
                        InvalidationReason::LimitExceeded,
                    )
                }
            }
        };

        for id in &evict {
            inner.invalidate(id, &reason, now);
        }
        inner.insert(session);

        Ok(evict)
    }

    async fn find(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        Ok(self
            .read("find_session")?
            .sessions
            .get(session_id)
            .map(|s| s.session.clone()))
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool, AuthError> {
        let mut inner = self.write("touch_session")?;
        match inner.sessions.get_mut(session_id) {
            Some(stored) if stored.session.is_active => {
                stored.session.last_accessed_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate(
        &self,
        session_id: &str,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        Ok(self.write("invalidate_session")?.invalidate(session_id, reason, at))
    }

    async fn rotate(
        &self,
        old_id: &str,
        replacement: &Session,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let mut inner = self.write("rotate_session")?;

        if inner.sessions.contains_key(replacement.id.expose_secret()) {
            return Err(AuthError::IdentifierCollision);
        }
        if !inner.invalidate(old_id, &InvalidationReason::Refreshed, at) {
            return Ok(false);
        }
        inner.insert(replacement);

        Ok(true)
    }

    async fn invalidate_user_sessions(
        &self,
        user_id: i64,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError> {
        let mut inner = self.write("invalidate_user_sessions")?;

        let ids: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.session.user_id == user_id && s.session.is_active)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            inner.invalidate(id, reason, at);
        }

        Ok(ids)
    }

    async fn active_sessions_for_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError> {
        let inner = self.read("active_sessions_for_user")?;
        Ok(inner
            .live_for_user(user_id, now)
            .into_iter()
            .map(|(_, s)| s.session.clone())
            .collect())
    }

    async fn invalidate_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut inner = self.write("invalidate_expired_sessions")?;

        let mut count = 0u64;
        for stored in inner.sessions.values_mut() {
            if stored.session.is_active && stored.session.expires_at < now {
                stored.session.is_active = false;
                stored.session.invalidation_reason = Some(InvalidationReason::Expired);
                stored.session.invalidated_at = Some(now);
                count += 1;
            }
        }

        Ok(count)
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn prune_invalidated(&self, before: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut inner = self.write("prune_invalidated_sessions")?;
        let before_count = inner.sessions.len();

        inner.sessions.retain(|_, s| {
            s.session.is_active || s.session.invalidated_at.is_none_or(|at| at >= before)
        });

        let pruned = before_count.saturating_sub(inner.sessions.len());
        Ok(u64::try_from(pruned).unwrap_or(u64::MAX))
    }
}
