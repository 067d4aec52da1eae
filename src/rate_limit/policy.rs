use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};

use super::attempts::{AttemptLedger, LoginAttempt};
use super::config_store::RateLimitConfigRepository;
use super::lockout::{AccountLockout, LockoutCreation, LockoutKind, LockoutLedger, NewLockout};
use crate::audit::{self, AuditAction, AuditEntry, AuditSink, LoggingAuditSink};
use crate::config::{LockoutScope, RateLimitConfig};
use crate::session::RequestContext;
use crate::sweeper::{self, SweeperHandle};
use crate::{AuthError, LOG_TARGET};

/// Result of a pre-attempt admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied {
        lockout: AccountLockout,
        /// `None` while the lockout is indefinite.
        retry_after: Option<Duration>,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Remaining lockout rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> Option<i64> {
        match self {
            Self::Denied {
                retry_after: Some(d),
                ..
            } => Some(((d.num_milliseconds() + 999) / 1000).max(1)),
            _ => None,
        }
    }

    /// Maps a denial to `AuthError::RateLimited`.
    pub fn ensure_admitted(&self) -> Result<(), AuthError> {
        match self {
            Self::Admitted => Ok(()),
            Self::Denied { .. } => Err(AuthError::RateLimited {
                retry_after_secs: self.retry_after_secs(),
            }),
        }
    }
}

/// Counts from one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSweepResult {
    pub attempts_pruned: u64,
    pub lockouts_expired: u64,
}

/// Identities are compared case-insensitively.
fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// Brute-force defense: decides admission from the attempt and lockout
/// ledgers and places progressive lockouts.
///
/// ```rust
/// use std::sync::Arc;
/// use custodia::RateLimitConfig;
/// use custodia::rate_limit::{InMemoryAttemptLedger, InMemoryLockoutLedger, RateLimitPolicy};
/// use custodia::session::RequestContext;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let policy = RateLimitPolicy::new(
///     Arc::new(InMemoryAttemptLedger::new()),
///     Arc::new(InMemoryLockoutLedger::new()),
///     RateLimitConfig { max_attempts_per_identity: 2, ..Default::default() },
/// ).unwrap();
///
/// let ctx = RequestContext::new(Some("203.0.113.7"), None);
/// for _ in 0..2 {
///     assert!(policy.admit_attempt("alice", &ctx).await.unwrap().is_admitted());
///     policy.record_attempt("alice", &ctx, false).await.unwrap();
/// }
/// assert!(!policy.admit_attempt("alice", &ctx).await.unwrap().is_admitted());
/// # });
/// ```
pub struct RateLimitPolicy {
    attempts: Arc<dyn AttemptLedger>,
    lockouts: Arc<dyn LockoutLedger>,
    config: RwLock<RateLimitConfig>,
    config_repository: Option<Arc<dyn RateLimitConfigRepository>>,
    /// Serializes read-modify-write config changes across the persistence await.
    config_writer: tokio::sync::Mutex<()>,
    audit: Arc<dyn AuditSink>,
}

impl RateLimitPolicy {
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `config` does not validate.
    pub fn new(
        attempts: Arc<dyn AttemptLedger>,
        lockouts: Arc<dyn LockoutLedger>,
        config: RateLimitConfig,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        Ok(Self {
            attempts,
            lockouts,
            config: RwLock::new(config),
            config_repository: None,
            config_writer: tokio::sync::Mutex::new(()),
            audit: Arc::new(LoggingAuditSink::new()),
        })
    }

    /// Loads the persisted configuration, saving the defaults on first use.
    /// Later [`update_config`](Self::update_config) calls are persisted too.
    pub async fn from_repository(
        attempts: Arc<dyn AttemptLedger>,
        lockouts: Arc<dyn LockoutLedger>,
        repository: Arc<dyn RateLimitConfigRepository>,
    ) -> Result<Self, AuthError> {
        let config = match repository.load().await? {
            Some(config) => config,
            None => {
                let config = RateLimitConfig::default();
                repository.save(&config).await?;
                config
            }
        };

        let mut policy = Self::new(attempts, lockouts, config)?;
        policy.config_repository = Some(repository);
        Ok(policy)
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> RateLimitConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pre-attempt check. Does not record anything in the attempt ledger.
    ///
    /// Whitelisted addresses are always admitted. Otherwise an active lockout
    /// on a covered key denies; failing that, failure counts are compared to
    /// the thresholds and a breach places a new lockout and denies.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "admit_attempt", skip_all, err))]
    pub async fn admit_attempt(
        &self,
        identity: &str,
        ctx: &RequestContext,
    ) -> Result<Admission, AuthError> {
        let identity = normalize_identity(identity);
        let config = self.config();
        let now = Utc::now();

        if config.is_whitelisted(&ctx.address) {
            return Ok(Admission::Admitted);
        }

        if let Some(lockout) = self
            .active_lockout(&identity, &ctx.address, config.lockout_scope, now)
            .await?
        {
            return Ok(self.deny(lockout, &identity, ctx, now).await);
        }

        let window_start = now - config.window;
        let scope = config.lockout_scope;

        let identity_failures = if scope.covers_identity() {
            let mut since = window_start;
            if let Some(t) = self.lockouts.latest_locked_at_for_identity(&identity).await? {
                since = since.max(t);
            }
            if let Some(t) = self.attempts.last_success_for_identity(&identity).await? {
                since = since.max(t);
            }
            self.attempts
                .count_failures_for_identity(&identity, since)
                .await?
        } else {
            0
        };

        let address_failures = if scope.covers_address() {
            let mut since = window_start;
            if let Some(t) = self.lockouts.latest_locked_at_for_address(&ctx.address).await? {
                since = since.max(t);
            }
            self.attempts
                .count_failures_for_address(&ctx.address, since)
                .await?
        } else {
            0
        };

        let identity_tripped =
            scope.covers_identity() && identity_failures >= config.max_attempts_per_identity;
        let address_tripped =
            scope.covers_address() && address_failures >= config.max_attempts_per_address;

        let new_lockout = match (identity_tripped, address_tripped) {
            (false, false) => return Ok(Admission::Admitted),
            (true, true) => {
                let prior = self
                    .lockouts
                    .count_for_identity(&identity)
                    .await?
                    .max(self.lockouts.count_for_address(&ctx.address).await?);
                NewLockout {
                    identity: Some(identity.clone()),
                    address: Some(ctx.address.clone()),
                    kind: LockoutKind::Mixed,
                    reason: format!(
                        "{identity_failures} failed attempts for identity and {address_failures} from address"
                    ),
                    failure_count: identity_failures.max(address_failures),
                    duration: Some(config.lockout_duration(prior)),
                    carried_from: None,
                }
            }
            (true, false) => {
                let prior = self.lockouts.count_for_identity(&identity).await?;
                NewLockout {
                    identity: Some(identity.clone()),
                    address: None,
                    kind: LockoutKind::Account,
                    reason: format!("{identity_failures} failed attempts for identity"),
                    failure_count: identity_failures,
                    duration: Some(config.lockout_duration(prior)),
                    carried_from: None,
                }
            }
            (false, true) => {
                let prior = self.lockouts.count_for_address(&ctx.address).await?;
                NewLockout {
                    identity: None,
                    address: Some(ctx.address.clone()),
                    kind: LockoutKind::Address,
                    reason: format!("{address_failures} failed attempts from address"),
                    failure_count: address_failures,
                    duration: Some(config.lockout_duration(prior)),
                    carried_from: None,
                }
            }
        };

        let creation = self.lockouts.create_if_absent(&new_lockout, now).await?;
        if let LockoutCreation::Created(lockout) = &creation {
            self.report_lockout(lockout, None).await;
        }

        Ok(self.deny(creation.into_lockout(), &identity, ctx, now).await)
    }

    async fn active_lockout(
        &self,
        identity: &str,
        address: &str,
        scope: LockoutScope,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountLockout>, AuthError> {
        let by_identity = self
            .lockouts
            .find_active_for_identity(identity, now)
            .await?
            .filter(|l| scope.covers_identity() || l.kind == LockoutKind::Manual);
        if by_identity.is_some() {
            return Ok(by_identity);
        }

        Ok(self
            .lockouts
            .find_active_for_address(address, now)
            .await?
            .filter(|l| scope.covers_address() || l.kind == LockoutKind::Manual))
    }

    async fn deny(
        &self,
        lockout: AccountLockout,
        identity: &str,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Admission {
        log::info!(
            target: LOG_TARGET,
            "msg=\"attempt blocked\", lockout_id={}, kind={}",
            lockout.id,
            lockout.kind
        );
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(AuditAction::AttemptBlocked)
                .target(identity)
                .address(ctx.address.clone())
                .details(format!("lockout_id={}", lockout.id)),
        )
        .await;

        let retry_after = lockout.remaining_at(now);
        Admission::Denied {
            lockout,
            retry_after,
        }
    }

    async fn report_lockout(&self, lockout: &AccountLockout, actor_id: Option<i64>) {
        log::warn!(
            target: LOG_TARGET,
            "msg=\"lockout placed\", lockout_id={}, kind={}, duration_secs={}, failure_count={}",
            lockout.id,
            lockout.kind,
            lockout.duration_seconds,
            lockout.failure_count
        );

        let mut entry = AuditEntry::new(AuditAction::LockoutCreated).details(format!(
            "kind={}, duration_secs={}, reason={}",
            lockout.kind, lockout.duration_seconds, lockout.reason
        ));
        if let Some(actor_id) = actor_id {
            entry = entry.actor(actor_id);
        }
        if let Some(identity) = &lockout.identity {
            entry = entry.target(identity.clone());
        }
        if let Some(address) = &lockout.address {
            entry = entry.address(address.clone());
        }
        audit::emit(self.audit.as_ref(), entry).await;
    }

    /// Appends the attempt to the ledger. Called for every attempt, admitted
    /// or not, so the forensic trail is complete.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "record_attempt", skip(self, identity, ctx), err))]
    pub async fn record_attempt(
        &self,
        identity: &str,
        ctx: &RequestContext,
        success: bool,
    ) -> Result<LoginAttempt, AuthError> {
        let identity = normalize_identity(identity);
        let attempt = self
            .attempts
            .record(&identity, &ctx.address, &ctx.fingerprint, success, Utc::now())
            .await?;

        let action = if success {
            AuditAction::LoginSucceeded
        } else {
            log::info!(target: LOG_TARGET, "msg=\"failed attempt recorded\"");
            AuditAction::LoginFailed
        };
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(action)
                .target(identity)
                .address(ctx.address.clone()),
        )
        .await;

        Ok(attempt)
    }

    /// Places an operator lockout. `duration` of `None` locks until unlocked.
    ///
    /// Active lockouts on the named keys are released so the manual one takes
    /// precedence. A released lockout that also covered a key the operator did
    /// not name is carried over: that key stays locked until the original
    /// lockout would have ended.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "lock_manually", skip(self, identity, address), err))]
    pub async fn lock_manually(
        &self,
        identity: Option<&str>,
        address: Option<&str>,
        reason: &str,
        duration: Option<Duration>,
        actor_id: Option<i64>,
    ) -> Result<AccountLockout, AuthError> {
        if identity.is_none() && address.is_none() {
            return Err(AuthError::ConfigurationError(
                "manual lockout needs an identity or an address".to_owned(),
            ));
        }
        if duration.is_some_and(|d| d <= Duration::zero()) {
            return Err(AuthError::ConfigurationError(
                "manual lockout duration must be positive".to_owned(),
            ));
        }

        let identity = identity.map(normalize_identity);
        let address = address.map(str::trim);
        let now = Utc::now();

        let mut superseded = Vec::new();
        if let Some(identity) = &identity {
            superseded.extend(self.lockouts.unlock_identity(identity, now).await?);
        }
        if let Some(address) = address {
            superseded.extend(self.lockouts.unlock_address(address, now).await?);
        }

        let creation = self
            .lockouts
            .create_if_absent(
                &NewLockout {
                    identity: identity.clone(),
                    address: address.map(str::to_owned),
                    kind: LockoutKind::Manual,
                    reason: reason.to_owned(),
                    failure_count: 0,
                    duration,
                    carried_from: None,
                },
                now,
            )
            .await?;

        if let LockoutCreation::Created(lockout) = &creation {
            self.report_lockout(lockout, actor_id).await;
        }

        for released in &superseded {
            let Some(remainder) = released.remainder(identity.as_deref(), address, now) else {
                continue;
            };
            if let LockoutCreation::Created(carried) =
                self.lockouts.create_if_absent(&remainder, now).await?
            {
                log::info!(
                    target: LOG_TARGET,
                    "msg=\"lockout carried over\", lockout_id={}, carried_from={}, kind={}",
                    carried.id,
                    released.id,
                    carried.kind
                );
            }
        }

        Ok(creation.into_lockout())
    }

    /// Releases every active lockout on the identity. Returns how many.
    pub async fn unlock_identity(
        &self,
        identity: &str,
        actor_id: Option<i64>,
    ) -> Result<u64, AuthError> {
        let identity = normalize_identity(identity);
        let released = self.lockouts.unlock_identity(&identity, Utc::now()).await?;
        let released = u64::try_from(released.len()).unwrap_or(u64::MAX);

        if released > 0 {
            let mut entry = AuditEntry::new(AuditAction::LockoutReleased)
                .target(identity)
                .details(format!("released={released}"));
            if let Some(actor_id) = actor_id {
                entry = entry.actor(actor_id);
            }
            audit::emit(self.audit.as_ref(), entry).await;
        }
        Ok(released)
    }

    /// Releases every active lockout on the address. Returns how many.
    pub async fn unlock_address(
        &self,
        address: &str,
        actor_id: Option<i64>,
    ) -> Result<u64, AuthError> {
        let released = self.lockouts.unlock_address(address, Utc::now()).await?;
        let released = u64::try_from(released.len()).unwrap_or(u64::MAX);

        if released > 0 {
            let mut entry = AuditEntry::new(AuditAction::LockoutReleased)
                .address(address)
                .details(format!("released={released}"));
            if let Some(actor_id) = actor_id {
                entry = entry.actor(actor_id);
            }
            audit::emit(self.audit.as_ref(), entry).await;
        }
        Ok(released)
    }

    /// Validates, persists (when a repository is configured) and activates
    /// a new configuration.
    pub async fn update_config(
        &self,
        config: RateLimitConfig,
        actor_id: Option<i64>,
    ) -> Result<(), AuthError> {
        let _writer = self.config_writer.lock().await;
        self.apply_config(config, actor_id, AuditAction::RateLimitConfigChanged, None)
            .await
    }

    pub async fn add_to_whitelist(
        &self,
        address: &str,
        actor_id: Option<i64>,
    ) -> Result<(), AuthError> {
        let _writer = self.config_writer.lock().await;
        let mut config = self.config();
        if !config.whitelist.insert(address.trim().to_owned()) {
            return Ok(());
        }
        self.apply_config(
            config,
            actor_id,
            AuditAction::WhitelistChanged,
            Some(format!("added={address}")),
        )
        .await
    }

    pub async fn remove_from_whitelist(
        &self,
        address: &str,
        actor_id: Option<i64>,
    ) -> Result<(), AuthError> {
        let _writer = self.config_writer.lock().await;
        let mut config = self.config();
        if !config.whitelist.remove(address.trim()) {
            return Ok(());
        }
        self.apply_config(
            config,
            actor_id,
            AuditAction::WhitelistChanged,
            Some(format!("removed={address}")),
        )
        .await
    }

    /// Caller holds `config_writer`.
    async fn apply_config(
        &self,
        config: RateLimitConfig,
        actor_id: Option<i64>,
        action: AuditAction,
        details: Option<String>,
    ) -> Result<(), AuthError> {
        config.validate()?;
        if let Some(repository) = &self.config_repository {
            repository.save(&config).await?;
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;

        log::info!(target: LOG_TARGET, "msg=\"rate limit config updated\", action={action}");

        let mut entry = AuditEntry::new(action);
        if let Some(actor_id) = actor_id {
            entry = entry.actor(actor_id);
        }
        if let Some(details) = details {
            entry = entry.details(details);
        }
        audit::emit(self.audit.as_ref(), entry).await;
        Ok(())
    }

    /// Lockouts ever placed on the identity, newest first.
    pub async fn lockout_history(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<AccountLockout>, AuthError> {
        self.lockouts
            .history_for_identity(&normalize_identity(identity), limit)
            .await
    }

    /// Attempts against the identity, newest first.
    pub async fn recent_attempts(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<LoginAttempt>, AuthError> {
        self.attempts
            .recent_for_identity(&normalize_identity(identity), limit)
            .await
    }

    /// Deletes attempts past the retention horizon and marks elapsed
    /// lockouts unlocked. Lockout rows are kept.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "rate_limit_sweep", skip(self), err))]
    pub async fn sweep(&self) -> Result<RateLimitSweepResult, AuthError> {
        let now = Utc::now();
        let retention = self.config().attempt_retention;

        let attempts_pruned = self.attempts.prune_before(now - retention).await?;
        let lockouts_expired = self.lockouts.expire_elapsed(now).await?;

        if attempts_pruned > 0 || lockouts_expired > 0 {
            log::info!(
                target: LOG_TARGET,
                "msg=\"rate limit sweep\", attempts_pruned={attempts_pruned}, lockouts_expired={lockouts_expired}"
            );
        }

        Ok(RateLimitSweepResult {
            attempts_pruned,
            lockouts_expired,
        })
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> SweeperHandle {
        let policy = Arc::clone(self);
        sweeper::spawn("rate_limit", interval, move || {
            let policy = Arc::clone(&policy);
            async move { policy.sweep().await.map(|_| ()) }
        })
    }
}
