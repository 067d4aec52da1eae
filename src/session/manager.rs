use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::repository::SessionStore;
use super::{InvalidationReason, RequestContext, Session, SessionConfig};
use crate::audit::{self, AuditAction, AuditEntry, AuditSink, LoggingAuditSink, session_ref};
use crate::crypto::{constant_time_eq, generate_token, validate_token_format};
use crate::sweeper::{self, SweeperHandle};
use crate::{AuthError, LOG_TARGET};

/// Fresh identifiers are retried this many times on collision before giving up.
const MAX_ID_ATTEMPTS: usize = 3;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub expired: u64,
    pub pruned: u64,
}

/// Creates, validates, rotates and invalidates sessions.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use custodia::session::{InMemorySessionStore, RequestContext, SessionConfig, SessionManager};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let manager = SessionManager::new(
///     Arc::new(InMemorySessionStore::new()),
///     SessionConfig::default(),
/// ).unwrap();
///
/// let ctx = RequestContext::new(Some("203.0.113.7"), Some("Mozilla/5.0"));
/// let session = manager.create_session(42, "analyst", &ctx).await.unwrap();
/// let valid = manager.validate_session(session.id.expose_secret(), &ctx).await.unwrap();
/// assert_eq!(valid.user_id, 42);
/// # });
/// ```
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    config: SessionConfig,
}

impl SessionManager {
    /// Audits through [`LoggingAuditSink`] until [`with_audit_sink`](Self::with_audit_sink) replaces it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `config` does not validate.
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Result<Self, AuthError> {
        config.validate()?;
        Ok(Self {
            store,
            audit: Arc::new(LoggingAuditSink::new()),
            config,
        })
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn mint(
        &self,
        user_id: i64,
        role: &str,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        Ok(Session {
            id: generate_token(self.config.token_bytes)?,
            user_id,
            role: role.to_owned(),
            created_at: now,
            expires_at: now + self.config.ttl,
            last_accessed_at: now,
            address: ctx.address.clone(),
            fingerprint: ctx.fingerprint.clone(),
            csrf_token: generate_token(self.config.csrf_token_bytes)?,
            is_active: true,
            invalidation_reason: None,
            invalidated_at: None,
        })
    }

    /// Creates a session for an authenticated user.
    ///
    /// The session-count policy is enforced by the store in the same atomic
    /// step as the insert, so concurrent logins cannot overshoot the limit.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "create_session", skip(self, role, ctx), err))]
    pub async fn create_session(
        &self,
        user_id: i64,
        role: &str,
        ctx: &RequestContext,
    ) -> Result<Session, AuthError> {
        let limit = self.config.session_limit();

        for _ in 0..MAX_ID_ATTEMPTS {
            let now = Utc::now();
            let session = self.mint(user_id, role, ctx, now)?;

            match self.store.insert(&session, limit, now).await {
                Ok(evicted) => {
                    for id in &evicted {
                        audit::emit(
                            self.audit.as_ref(),
                            AuditEntry::new(AuditAction::SessionEvicted)
                                .actor(user_id)
                                .target(session_ref(id))
                                .details(format!("limit={limit:?}")),
                        )
                        .await;
                    }
                    audit::emit(
                        self.audit.as_ref(),
                        AuditEntry::new(AuditAction::SessionCreated)
                            .actor(user_id)
                            .target(session_ref(session.id.expose_secret()))
                            .address(ctx.address.clone()),
                    )
                    .await;

                    log::info!(
                        target: LOG_TARGET,
                        "msg=\"session created\", user_id={user_id}, evicted={}",
                        evicted.len()
                    );
                    return Ok(session);
                }
                Err(AuthError::IdentifierCollision) => {
                    log::warn!(
                        target: LOG_TARGET,
                        "msg=\"session identifier collision\", user_id={user_id}"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(AuthError::IdentifierCollision)
    }

    async fn invalidate_for(
        &self,
        session: &Session,
        session_id: &str,
        reason: InvalidationReason,
        action: AuditAction,
        ctx: &RequestContext,
    ) -> Result<(), AuthError> {
        if self
            .store
            .invalidate(session_id, &reason, Utc::now())
            .await?
        {
            audit::emit(
                self.audit.as_ref(),
                AuditEntry::new(action)
                    .actor(session.user_id)
                    .target(session_ref(session_id))
                    .address(ctx.address.clone())
                    .details(format!("reason={reason}")),
            )
            .await;
        }
        Ok(())
    }

    /// Checks a presented session identifier.
    ///
    /// Expiry and binding failures invalidate the session permanently. On
    /// success the access time is recorded and an owned copy returned.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "validate_session", skip_all, err))]
    pub async fn validate_session(
        &self,
        session_id: &str,
        ctx: &RequestContext,
    ) -> Result<Session, AuthError> {
        if !validate_token_format(session_id) {
            return Err(AuthError::InvalidSession);
        }

        let mut session = self
            .store
            .find(session_id)
            .await?
            .ok_or(AuthError::InvalidSession)?;

        if !session.is_active {
            return Err(AuthError::InvalidSession);
        }

        let now = Utc::now();
        if now > session.expires_at {
            self.invalidate_for(
                &session,
                session_id,
                InvalidationReason::Expired,
                AuditAction::SessionExpired,
                ctx,
            )
            .await?;
            return Err(AuthError::SessionExpired);
        }

        if self.config.bind_address && session.address != ctx.address {
            log::warn!(
                target: LOG_TARGET,
                "msg=\"session address mismatch\", user_id={}",
                session.user_id
            );
            self.invalidate_for(
                &session,
                session_id,
                InvalidationReason::SecurityViolation,
                AuditAction::SecurityViolation,
                ctx,
            )
            .await?;
            return Err(AuthError::AddressMismatch);
        }

        if self.config.bind_fingerprint && session.fingerprint != ctx.fingerprint {
            log::warn!(
                target: LOG_TARGET,
                "msg=\"session fingerprint mismatch\", user_id={}",
                session.user_id
            );
            self.invalidate_for(
                &session,
                session_id,
                InvalidationReason::SecurityViolation,
                AuditAction::SecurityViolation,
                ctx,
            )
            .await?;
            return Err(AuthError::FingerprintMismatch);
        }

        // lost a race with an invalidation between find and touch
        if !self.store.touch(session_id, now).await? {
            return Err(AuthError::InvalidSession);
        }
        session.last_accessed_at = now;

        Ok(session)
    }

    /// Validates then rotates: the old identifier is invalidated with reason
    /// `refreshed` and a new identifier and CSRF token are issued with a full ttl.
    ///
    /// Of two concurrent refreshes of one identifier exactly one succeeds; the
    /// other fails with `InvalidSession`.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "refresh_session", skip_all, err))]
    pub async fn refresh_session(
        &self,
        session_id: &str,
        ctx: &RequestContext,
    ) -> Result<Session, AuthError> {
        let current = self.validate_session(session_id, ctx).await?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let now = Utc::now();
            let mut replacement = self.mint(current.user_id, &current.role, ctx, now)?;
            // binding data follows the session, not the refreshing request
            replacement.address.clone_from(&current.address);
            replacement.fingerprint.clone_from(&current.fingerprint);

            match self.store.rotate(session_id, &replacement, now).await {
                Ok(true) => {
                    audit::emit(
                        self.audit.as_ref(),
                        AuditEntry::new(AuditAction::SessionRefreshed)
                            .actor(current.user_id)
                            .target(session_ref(replacement.id.expose_secret()))
                            .address(ctx.address.clone())
                            .details(format!("replaced={}", session_ref(session_id))),
                    )
                    .await;

                    log::info!(
                        target: LOG_TARGET,
                        "msg=\"session refreshed\", user_id={}",
                        current.user_id
                    );
                    return Ok(replacement);
                }
                Ok(false) => return Err(AuthError::InvalidSession),
                Err(AuthError::IdentifierCollision) => {
                    log::warn!(
                        target: LOG_TARGET,
                        "msg=\"session identifier collision\", user_id={}",
                        current.user_id
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(AuthError::IdentifierCollision)
    }

    /// Idempotent. Returns whether this call performed the transition.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "invalidate_session", skip(self, session_id), err))]
    pub async fn invalidate_session(
        &self,
        session_id: &str,
        reason: InvalidationReason,
    ) -> Result<bool, AuthError> {
        if !validate_token_format(session_id) {
            return Ok(false);
        }

        let Some(session) = self.store.find(session_id).await? else {
            return Ok(false);
        };

        let invalidated = self
            .store
            .invalidate(session_id, &reason, Utc::now())
            .await?;

        if invalidated {
            audit::emit(
                self.audit.as_ref(),
                AuditEntry::new(AuditAction::SessionInvalidated)
                    .actor(session.user_id)
                    .target(session_ref(session_id))
                    .details(format!("reason={reason}")),
            )
            .await;

            log::info!(
                target: LOG_TARGET,
                "msg=\"session invalidated\", user_id={}, reason={reason}",
                session.user_id
            );
        }

        Ok(invalidated)
    }

    /// Validates the session, then compares `token` against its CSRF token in
    /// constant time. A mismatch invalidates the session.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "validate_csrf_token", skip_all, err))]
    pub async fn validate_csrf_token(
        &self,
        session_id: &str,
        token: &str,
        ctx: &RequestContext,
    ) -> Result<Session, AuthError> {
        let session = self.validate_session(session_id, ctx).await?;

        if !constant_time_eq(
            token.as_bytes(),
            session.csrf_token.expose_secret().as_bytes(),
        ) {
            log::warn!(
                target: LOG_TARGET,
                "msg=\"csrf token mismatch\", user_id={}",
                session.user_id
            );
            self.invalidate_for(
                &session,
                session_id,
                InvalidationReason::SecurityViolation,
                AuditAction::CsrfMismatch,
                ctx,
            )
            .await?;
            return Err(AuthError::InvalidCsrfToken);
        }

        Ok(session)
    }

    /// Logs a user out everywhere. Returns the number of sessions invalidated.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "invalidate_user_sessions", skip(self), err))]
    pub async fn invalidate_user_sessions(
        &self,
        user_id: i64,
        reason: InvalidationReason,
    ) -> Result<usize, AuthError> {
        let ids = self
            .store
            .invalidate_user_sessions(user_id, &reason, Utc::now())
            .await?;

        for id in &ids {
            audit::emit(
                self.audit.as_ref(),
                AuditEntry::new(AuditAction::SessionInvalidated)
                    .actor(user_id)
                    .target(session_ref(id))
                    .details(format!("reason={reason}")),
            )
            .await;
        }

        log::info!(
            target: LOG_TARGET,
            "msg=\"user sessions invalidated\", user_id={user_id}, count={}",
            ids.len()
        );

        Ok(ids.len())
    }

    /// Active, unexpired sessions of a user, oldest first.
    pub async fn active_sessions(&self, user_id: i64) -> Result<Vec<Session>, AuthError> {
        self.store
            .active_sessions_for_user(user_id, Utc::now())
            .await
    }

    /// One cleanup pass: expired sessions are invalidated and invalidated
    /// sessions older than the retention period are deleted.
    #[cfg_attr(feature = "tracing", tracing::instrument(name = "session_sweep", skip(self), err))]
    pub async fn sweep(&self) -> Result<SweepResult, AuthError> {
        let now = Utc::now();
        let expired = self.store.invalidate_expired(now).await?;
        let pruned = self
            .store
            .prune_invalidated(now - self.config.invalidated_retention)
            .await?;

        if expired > 0 || pruned > 0 {
            log::info!(
                target: LOG_TARGET,
                "msg=\"session sweep\", expired={expired}, pruned={pruned}"
            );
        }

        Ok(SweepResult { expired, pruned })
    }

    /// Runs [`sweep`](Self::sweep) every `cleanup_interval` on the current
    /// tokio runtime until the returned handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let manager = Arc::clone(self);
        sweeper::spawn("sessions", self.config.cleanup_interval, move || {
            let manager = Arc::clone(&manager);
            async move { manager.sweep().await.map(|_| ()) }
        })
    }
}
