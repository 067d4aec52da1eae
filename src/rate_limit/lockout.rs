use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockoutKind {
    /// Keyed by identity.
    Account,
    /// Keyed by source address.
    Address,
    /// Both thresholds tripped at once; keyed by identity and address.
    Mixed,
    /// Placed by an operator. Checked regardless of the configured scope and
    /// excluded from progressive backoff counts.
    Manual,
}

impl LockoutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Address => "address",
            Self::Mixed => "mixed",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for LockoutKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(Self::Account),
            "address" => Ok(Self::Address),
            "mixed" => Ok(Self::Mixed),
            "manual" => Ok(Self::Manual),
            other => Err(AuthError::DatabaseError(format!(
                "unknown lockout kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for LockoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lockout record. Never deleted, only marked unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLockout {
    pub id: i64,
    pub identity: Option<String>,
    pub address: Option<String>,
    pub kind: LockoutKind,
    pub locked_at: DateTime<Utc>,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub failure_count: u32,
    /// 0 means indefinite.
    pub duration_seconds: i64,
    /// `locked_at + duration_seconds`; `None` when indefinite.
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when this lockout keeps one key of an earlier lockout locked after
    /// a manual lockout took over its other key. Not counted for backoff.
    pub carried_from: Option<i64>,
}

impl AccountLockout {
    pub fn is_indefinite(&self) -> bool {
        self.expires_at.is_none()
    }

    /// Unlocked explicitly or elapsed, whichever came first.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.unlocked_at.is_none() && self.expires_at.is_none_or(|exp| exp > now)
    }

    /// `None` for indefinite lockouts.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|exp| (exp - now).max(Duration::zero()))
    }

    /// Remainder of this lockout once `identity` and `address` are taken
    /// over by another lockout: the keys it covers that were not named, for
    /// the time it had left. `None` when nothing remains.
    pub fn remainder(
        &self,
        identity: Option<&str>,
        address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<NewLockout> {
        let kept_identity = self
            .identity
            .clone()
            .filter(|i| identity != Some(i.as_str()));
        let kept_address = self
            .address
            .clone()
            .filter(|a| address != Some(a.as_str()));

        let kind = match (&kept_identity, &kept_address) {
            (None, None) => return None,
            _ if self.kind == LockoutKind::Manual => LockoutKind::Manual,
            (Some(_), Some(_)) => self.kind,
            (Some(_), None) => LockoutKind::Account,
            (None, Some(_)) => LockoutKind::Address,
        };

        let duration = match self.expires_at {
            Some(exp) if exp <= now => return None,
            Some(exp) => Some(exp - now),
            None => None,
        };

        Some(NewLockout {
            identity: kept_identity,
            address: kept_address,
            kind,
            reason: format!("carried over from lockout {}: {}", self.id, self.reason),
            failure_count: self.failure_count,
            duration,
            carried_from: Some(self.id),
        })
    }

    fn counts_for_backoff(&self) -> bool {
        self.kind != LockoutKind::Manual && self.carried_from.is_none()
    }

    fn matches_identity(&self, identity: &str) -> bool {
        self.identity.as_deref() == Some(identity)
    }

    fn matches_address(&self, address: &str) -> bool {
        self.address.as_deref() == Some(address)
    }
}

/// A lockout about to be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLockout {
    pub identity: Option<String>,
    pub address: Option<String>,
    pub kind: LockoutKind,
    pub reason: String,
    pub failure_count: u32,
    /// `None` for indefinite.
    pub duration: Option<Duration>,
    pub carried_from: Option<i64>,
}

impl NewLockout {
    pub(crate) fn into_lockout(self, id: i64, now: DateTime<Utc>) -> AccountLockout {
        AccountLockout {
            id,
            identity: self.identity,
            address: self.address,
            kind: self.kind,
            locked_at: now,
            unlocked_at: None,
            reason: self.reason,
            failure_count: self.failure_count,
            duration_seconds: self.duration.map_or(0, |d| d.num_seconds()),
            expires_at: self.duration.map(|d| now + d),
            carried_from: self.carried_from,
        }
    }
}

/// Outcome of [`LockoutLedger::create_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockoutCreation {
    Created(AccountLockout),
    /// A concurrent caller already holds an active lockout on one of the keys.
    Existing(AccountLockout),
}

impl LockoutCreation {
    pub fn lockout(&self) -> &AccountLockout {
        match self {
            Self::Created(l) | Self::Existing(l) => l,
        }
    }

    pub fn into_lockout(self) -> AccountLockout {
        match self {
            Self::Created(l) | Self::Existing(l) => l,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Lockout storage.
///
/// At most one active lockout exists per identity and per address. Expiry is
/// evaluated on read against `now`; [`expire_elapsed`](Self::expire_elapsed)
/// only makes elapsed lockouts visible as unlocked in the history.
#[async_trait]
pub trait LockoutLedger: Send + Sync {
    /// Inserts `lockout` unless an active lockout already covers its identity
    /// or its address. Check and insert are one atomic step.
    async fn create_if_absent(
        &self,
        lockout: &NewLockout,
        now: DateTime<Utc>,
    ) -> Result<LockoutCreation, AuthError>;

    async fn find_active_for_identity(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError>;

    async fn find_active_for_address(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError>;

    async fn latest_locked_at_for_identity(
        &self,
        identity: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError>;

    async fn latest_locked_at_for_address(
        &self,
        address: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError>;

    /// Lockouts ever placed on the identity, manual and carried-over ones
    /// excluded.
    async fn count_for_identity(&self, identity: &str) -> Result<u32, AuthError>;

    /// Lockouts ever placed on the address, manual and carried-over ones
    /// excluded.
    async fn count_for_address(&self, address: &str) -> Result<u32, AuthError>;

    /// Returns false if the lockout was already unlocked or does not exist.
    async fn unlock(&self, id: i64, at: DateTime<Utc>) -> Result<bool, AuthError>;

    /// Releases every active lockout covering the identity and returns them.
    async fn unlock_identity(
        &self,
        identity: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AccountLockout>, AuthError>;

    /// Releases every active lockout covering the address and returns them.
    async fn unlock_address(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AccountLockout>, AuthError>;

    /// Sets `unlocked_at = expires_at` on every elapsed lockout.
    async fn expire_elapsed(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;

    /// Newest first.
    async fn history_for_identity(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<AccountLockout>, AuthError>;
}

#[derive(Default)]
struct LockoutTable {
    lockouts: Vec<AccountLockout>,
    next_id: i64,
}

#[derive(Clone, Default)]
pub struct InMemoryLockoutLedger {
    table: Arc<RwLock<LockoutTable>>,
}

impl InMemoryLockoutLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, operation: &str) -> Result<std::sync::RwLockReadGuard<'_, LockoutTable>, AuthError> {
        self.table
            .read()
            .map_err(|_| AuthError::storage(operation, "lock poisoned"))
    }

    fn write(&self, operation: &str) -> Result<std::sync::RwLockWriteGuard<'_, LockoutTable>, AuthError> {
        self.table
            .write()
            .map_err(|_| AuthError::storage(operation, "lock poisoned"))
    }

    fn find_active<F>(
        &self,
        operation: &str,
        now: DateTime<Utc>,
        key: F,
    ) -> Result<Option<AccountLockout>, AuthError>
    where
        F: Fn(&AccountLockout) -> bool,
    {
        Ok(self
            .read(operation)?
            .lockouts
            .iter()
            .filter(|l| l.is_active_at(now) && key(l))
            .max_by_key(|l| (l.locked_at, l.id))
            .cloned())
    }

    fn unlock_where<F>(
        &self,
        operation: &str,
        at: DateTime<Utc>,
        key: F,
    ) -> Result<Vec<AccountLockout>, AuthError>
    where
        F: Fn(&AccountLockout) -> bool,
    {
        let mut table = self.write(operation)?;
        let mut released = Vec::new();
        for lockout in table.lockouts.iter_mut() {
            if lockout.is_active_at(at) && key(lockout) {
                lockout.unlocked_at = Some(at);
                released.push(lockout.clone());
            }
        }
        Ok(released)
    }
}

#[async_trait]
#[allow(clippy::significant_drop_tightening)]
impl LockoutLedger for InMemoryLockoutLedger {
    async fn create_if_absent(
        &self,
        lockout: &NewLockout,
        now: DateTime<Utc>,
    ) -> Result<LockoutCreation, AuthError> {
        let mut table = self.write("create_lockout")?;

        let existing = table.lockouts.iter().find(|l| {
            l.is_active_at(now)
                && (lockout.identity.as_deref().is_some_and(|i| l.matches_identity(i))
                    || lockout.address.as_deref().is_some_and(|a| l.matches_address(a)))
        });
        if let Some(existing) = existing {
            return Ok(LockoutCreation::Existing(existing.clone()));
        }

        table.next_id += 1;
        let created = lockout.clone().into_lockout(table.next_id, now);
        table.lockouts.push(created.clone());

        Ok(LockoutCreation::Created(created))
    }

    async fn find_active_for_identity(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError> {
        self.find_active("find_active_lockout_for_identity", now, |l| l.matches_identity(identity))
    }

    async fn find_active_for_address(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError> {
        self.find_active("find_active_lockout_for_address", now, |l| l.matches_address(address))
    }

    async fn latest_locked_at_for_identity(
        &self,
        identity: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        Ok(self
            .read("latest_lockout_for_identity")?
            .lockouts
            .iter()
            .filter(|l| l.matches_identity(identity))
            .map(|l| l.locked_at)
            .max())
    }

    async fn latest_locked_at_for_address(
        &self,
        address: &str,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        Ok(self
            .read("latest_lockout_for_address")?
            .lockouts
            .iter()
            .filter(|l| l.matches_address(address))
            .map(|l| l.locked_at)
            .max())
    }

    async fn count_for_identity(&self, identity: &str) -> Result<u32, AuthError> {
        let count = self
            .read("count_lockouts_for_identity")?
            .lockouts
            .iter()
            .filter(|l| l.counts_for_backoff() && l.matches_identity(identity))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn count_for_address(&self, address: &str) -> Result<u32, AuthError> {
        let count = self
            .read("count_lockouts_for_address")?
            .lockouts
            .iter()
            .filter(|l| l.counts_for_backoff() && l.matches_address(address))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn unlock(&self, id: i64, at: DateTime<Utc>) -> Result<bool, AuthError> {
        Ok(!self.unlock_where("unlock_lockout", at, |l| l.id == id)?.is_empty())
    }

    async fn unlock_identity(
        &self,
        identity: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AccountLockout>, AuthError> {
        self.unlock_where("unlock_identity", at, |l| l.matches_identity(identity))
    }

    async fn unlock_address(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AccountLockout>, AuthError> {
        self.unlock_where("unlock_address", at, |l| l.matches_address(address))
    }

    async fn expire_elapsed(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut table = self.write("expire_elapsed_lockouts")?;
        let mut count = 0u64;
        for lockout in table.lockouts.iter_mut() {
            if let (None, Some(exp)) = (lockout.unlocked_at, lockout.expires_at) {
                if exp <= now {
                    lockout.unlocked_at = Some(exp);
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn history_for_identity(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<AccountLockout>, AuthError> {
        let mut history: Vec<AccountLockout> = self
            .read("lockout_history")?
            .lockouts
            .iter()
            .filter(|l| l.matches_identity(identity))
            .cloned()
            .collect();
        history.sort_by(|a, b| b.locked_at.cmp(&a.locked_at).then(b.id.cmp(&a.id)));
        history.truncate(limit);
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_lockout(identity: &str, minutes: i64) -> NewLockout {
        NewLockout {
            identity: Some(identity.to_owned()),
            address: None,
            kind: LockoutKind::Account,
            reason: "too many failed attempts".to_owned(),
            failure_count: 5,
            duration: Some(Duration::minutes(minutes)),
            carried_from: None,
        }
    }

    #[test]
    fn test_lockout_activity() {
        let now = Utc::now();
        let lockout = account_lockout("alice", 15).into_lockout(1, now);

        assert!(lockout.is_active_at(now));
        assert!(lockout.is_active_at(now + Duration::minutes(14)));
        assert!(!lockout.is_active_at(now + Duration::minutes(15)));
        assert_eq!(lockout.duration_seconds, 900);
        assert_eq!(
            lockout.remaining_at(now + Duration::minutes(5)),
            Some(Duration::minutes(10))
        );
        assert_eq!(
            lockout.remaining_at(now + Duration::hours(1)),
            Some(Duration::zero())
        );
    }

    #[test]
    fn test_indefinite_lockout() {
        let now = Utc::now();
        let lockout = NewLockout {
            duration: None,
            kind: LockoutKind::Manual,
            ..account_lockout("alice", 0)
        }
        .into_lockout(1, now);

        assert!(lockout.is_indefinite());
        assert_eq!(lockout.duration_seconds, 0);
        assert!(lockout.is_active_at(now + Duration::days(3650)));
        assert_eq!(lockout.remaining_at(now), None);
    }

    #[test]
    fn test_remainder_keeps_unnamed_key() {
        let now = Utc::now();
        let mixed = NewLockout {
            identity: Some("alice".to_owned()),
            address: Some("203.0.113.5".to_owned()),
            kind: LockoutKind::Mixed,
            reason: "both thresholds".to_owned(),
            failure_count: 5,
            duration: Some(Duration::minutes(30)),
            carried_from: None,
        }
        .into_lockout(4, now - Duration::minutes(10));

        let rest = mixed.remainder(Some("alice"), None, now).unwrap();
        assert_eq!(rest.identity, None);
        assert_eq!(rest.address.as_deref(), Some("203.0.113.5"));
        assert_eq!(rest.kind, LockoutKind::Address);
        assert_eq!(rest.duration, Some(Duration::minutes(20)));
        assert_eq!(rest.carried_from, Some(4));
        assert_eq!(rest.into_lockout(9, now).expires_at, mixed.expires_at);

        assert_eq!(
            mixed.remainder(None, Some("203.0.113.5"), now).unwrap().kind,
            LockoutKind::Account
        );
        assert!(mixed.remainder(Some("alice"), Some("203.0.113.5"), now).is_none());
        assert!(
            mixed
                .remainder(Some("alice"), None, now + Duration::hours(1))
                .is_none()
        );

        let account = account_lockout("bob", 15).into_lockout(5, now);
        assert!(account.remainder(Some("bob"), None, now).is_none());
    }

    #[tokio::test]
    async fn test_carried_over_lockouts_not_counted() {
        let ledger = InMemoryLockoutLedger::new();
        let now = Utc::now();

        ledger
            .create_if_absent(
                &NewLockout {
                    carried_from: Some(1),
                    ..account_lockout("alice", 15)
                },
                now,
            )
            .await
            .unwrap();

        assert_eq!(ledger.count_for_identity("alice").await.unwrap(), 0);
        assert!(
            ledger
                .find_active_for_identity("alice", now)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_kind_parse() {
        for kind in [
            LockoutKind::Account,
            LockoutKind::Address,
            LockoutKind::Mixed,
            LockoutKind::Manual,
        ] {
            assert_eq!(kind.as_str().parse::<LockoutKind>().unwrap(), kind);
        }
        assert!("permanent".parse::<LockoutKind>().is_err());
    }

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive_per_key() {
        let ledger = InMemoryLockoutLedger::new();
        let now = Utc::now();

        let first = ledger
            .create_if_absent(&account_lockout("alice", 15), now)
            .await
            .unwrap();
        assert!(first.is_created());

        let second = ledger
            .create_if_absent(&account_lockout("alice", 30), now)
            .await
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.lockout().id, first.lockout().id);

        let other = ledger
            .create_if_absent(&account_lockout("bob", 15), now)
            .await
            .unwrap();
        assert!(other.is_created());
    }

    #[tokio::test]
    async fn test_mixed_lockout_blocks_address_key() {
        let ledger = InMemoryLockoutLedger::new();
        let now = Utc::now();

        let mixed = NewLockout {
            identity: Some("alice".to_owned()),
            address: Some("203.0.113.5".to_owned()),
            kind: LockoutKind::Mixed,
            reason: "identity and address thresholds".to_owned(),
            failure_count: 5,
            duration: Some(Duration::minutes(15)),
            carried_from: None,
        };
        ledger.create_if_absent(&mixed, now).await.unwrap();

        let by_address = NewLockout {
            identity: None,
            address: Some("203.0.113.5".to_owned()),
            kind: LockoutKind::Address,
            reason: "address threshold".to_owned(),
            failure_count: 20,
            duration: Some(Duration::minutes(15)),
            carried_from: None,
        };
        assert!(
            !ledger
                .create_if_absent(&by_address, now)
                .await
                .unwrap()
                .is_created()
        );
        assert!(
            ledger
                .find_active_for_address("203.0.113.5", now)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_elapsed_lockout_allows_new_one() {
        let ledger = InMemoryLockoutLedger::new();
        let start = Utc::now() - Duration::hours(1);

        ledger
            .create_if_absent(&account_lockout("alice", 15), start)
            .await
            .unwrap();

        let now = Utc::now();
        assert!(
            ledger
                .find_active_for_identity("alice", now)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            ledger
                .create_if_absent(&account_lockout("alice", 30), now)
                .await
                .unwrap()
                .is_created()
        );
        assert_eq!(ledger.count_for_identity("alice").await.unwrap(), 2);
        assert_eq!(
            ledger.latest_locked_at_for_identity("alice").await.unwrap(),
            Some(now)
        );
    }

    #[tokio::test]
    async fn test_unlock() {
        let ledger = InMemoryLockoutLedger::new();
        let now = Utc::now();

        let created = ledger
            .create_if_absent(&account_lockout("alice", 15), now)
            .await
            .unwrap()
            .into_lockout();

        assert!(ledger.unlock(created.id, now).await.unwrap());
        assert!(!ledger.unlock(created.id, now).await.unwrap());
        assert!(
            ledger
                .find_active_for_identity("alice", now)
                .await
                .unwrap()
                .is_none()
        );

        // record is kept
        let history = ledger.history_for_identity("alice", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].unlocked_at, Some(now));
    }

    #[tokio::test]
    async fn test_unlock_identity_and_address() {
        let ledger = InMemoryLockoutLedger::new();
        let now = Utc::now();

        ledger
            .create_if_absent(&account_lockout("alice", 15), now)
            .await
            .unwrap();
        ledger
            .create_if_absent(
                &NewLockout {
                    identity: None,
                    address: Some("198.51.100.1".to_owned()),
                    kind: LockoutKind::Address,
                    reason: "address threshold".to_owned(),
                    failure_count: 20,
                    duration: Some(Duration::minutes(15)),
                    carried_from: None,
                },
                now,
            )
            .await
            .unwrap();

        let released = ledger.unlock_identity("alice", now).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].unlocked_at, Some(now));
        assert_eq!(ledger.unlock_address("198.51.100.1", now).await.unwrap().len(), 1);
        assert!(ledger.unlock_address("198.51.100.1", now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_lockouts_not_counted() {
        let ledger = InMemoryLockoutLedger::new();
        let now = Utc::now();

        ledger
            .create_if_absent(
                &NewLockout {
                    kind: LockoutKind::Manual,
                    duration: None,
                    ..account_lockout("alice", 0)
                },
                now,
            )
            .await
            .unwrap();

        assert_eq!(ledger.count_for_identity("alice").await.unwrap(), 0);
        assert!(
            ledger
                .find_active_for_identity("alice", now + Duration::days(365))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_expire_elapsed() {
        let ledger = InMemoryLockoutLedger::new();
        let start = Utc::now() - Duration::hours(1);

        ledger
            .create_if_absent(&account_lockout("alice", 15), start)
            .await
            .unwrap();
        ledger
            .create_if_absent(&account_lockout("bob", 120), start)
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(ledger.expire_elapsed(now).await.unwrap(), 1);
        assert_eq!(ledger.expire_elapsed(now).await.unwrap(), 0);

        let alice = ledger.history_for_identity("alice", 1).await.unwrap();
        assert_eq!(alice[0].unlocked_at, Some(start + Duration::minutes(15)));
    }
}
