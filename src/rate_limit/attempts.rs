use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AuthError;

/// One authentication attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub id: i64,
    pub address: String,
    pub identity: String,
    pub success: bool,
    pub attempted_at: DateTime<Utc>,
    pub fingerprint: String,
}

/// Forensic record of every attempt, and the counts admission is decided on.
///
/// `since` bounds are inclusive.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    async fn record(
        &self,
        identity: &str,
        address: &str,
        fingerprint: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<LoginAttempt, AuthError>;

    async fn count_failures_for_identity(
        &self,
        identity: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, AuthError>;

    async fn count_failures_for_address(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, AuthError>;

    async fn last_success_for_identity(
        &self,
        identity: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError>;

    /// Newest first.
    async fn recent_for_identity(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<LoginAttempt>, AuthError>;

    /// Retention sweep. Returns the number of records deleted.
    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64, AuthError>;
}

#[derive(Default)]
struct AttemptLog {
    attempts: Vec<LoginAttempt>,
    next_id: i64,
}

/// For a single process only; use the SQLite ledger when several instances
/// share one user base.
#[derive(Clone, Default)]
pub struct InMemoryAttemptLedger {
    log: Arc<RwLock<AttemptLog>>,
}

impl InMemoryAttemptLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.read().map(|l| l.attempts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn count_failures<F>(&self, since: DateTime<Utc>, key: F) -> Result<u32, AuthError>
    where
        F: Fn(&LoginAttempt) -> bool,
    {
        let log = self
            .log
            .read()
            .map_err(|_| AuthError::storage("count_failed_attempts", "lock poisoned"))?;

        let count = log
            .attempts
            .iter()
            .filter(|a| !a.success && a.attempted_at >= since && key(a))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[async_trait]
#[allow(clippy::significant_drop_tightening)]
impl AttemptLedger for InMemoryAttemptLedger {
    async fn record(
        &self,
        identity: &str,
        address: &str,
        fingerprint: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<LoginAttempt, AuthError> {
        let mut log = self
            .log
            .write()
            .map_err(|_| AuthError::storage("record_attempt", "lock poisoned"))?;

        log.next_id += 1;
        let attempt = LoginAttempt {
            id: log.next_id,
            address: address.to_owned(),
            identity: identity.to_owned(),
            success,
            attempted_at: at,
            fingerprint: fingerprint.to_owned(),
        };
        log.attempts.push(attempt.clone());

        Ok(attempt)
    }

    async fn count_failures_for_identity(
        &self,
        identity: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, AuthError> {
        self.count_failures(since, |a| a.identity == identity)
    }

    async fn count_failures_for_address(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, AuthError> {
        self.count_failures(since, |a| a.address == address)
    }

    async fn last_success_for_identity(
        &self,
        identity: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        let log = self
            .log
            .read()
            .map_err(|_| AuthError::storage("last_success_for_identity", "lock poisoned"))?;

        Ok(log
            .attempts
            .iter()
            .filter(|a| a.success && a.identity == identity)
            .map(|a| a.attempted_at)
            .max())
    }

    async fn recent_for_identity(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<LoginAttempt>, AuthError> {
        let log = self
            .log
            .read()
            .map_err(|_| AuthError::storage("recent_attempts", "lock poisoned"))?;

        let mut recent: Vec<LoginAttempt> = log
            .attempts
            .iter()
            .filter(|a| a.identity == identity)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.attempted_at.cmp(&a.attempted_at).then(b.id.cmp(&a.id)));
        recent.truncate(limit);

        Ok(recent)
    }

    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut log = self
            .log
            .write()
            .map_err(|_| AuthError::storage("prune_attempts", "lock poisoned"))?;

        let before_count = log.attempts.len();
        log.attempts.retain(|a| a.attempted_at >= before);

        let pruned = before_count.saturating_sub(log.attempts.len());
        Ok(u64::try_from(pruned).unwrap_or(u64::MAX))
    }
}
