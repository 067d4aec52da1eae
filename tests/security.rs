//! Security-focused test suite.
//!
//! End-to-end checks of the security properties of the session and
//! brute-force defense core, on the in-memory backends.
//! Run with: `cargo test --features mocks --test security`

#![cfg(feature = "mocks")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use custodia::actions::{AuthenticateAction, MockCredentialRepository};
use custodia::audit::{AuditEntry, AuditSink, session_ref};
use custodia::crypto::{Argon2Hasher, generate_token, validate_token_format};
use custodia::rate_limit::{InMemoryAttemptLedger, InMemoryLockoutLedger, LockoutKind};
use custodia::session::{InMemorySessionStore, SessionLimit, SessionStore};
use custodia::{
    AuditAction, AuthError, EncryptionKey, FieldCipher, InMemoryAuditSink, InvalidationReason,
    RateLimitConfig, RateLimitPolicy, RequestContext, Session, SessionConfig, SessionManager,
    SessionState,
};

fn office() -> RequestContext {
    RequestContext::new(Some("192.0.2.10"), Some("Mozilla/5.0 (X11; Linux x86_64)"))
}

fn elsewhere() -> RequestContext {
    RequestContext::new(Some("203.0.113.99"), Some("Mozilla/5.0 (X11; Linux x86_64)"))
}

fn sessions_with(config: SessionConfig) -> (Arc<SessionManager>, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::new());
    let manager = SessionManager::new(Arc::clone(&store) as Arc<dyn SessionStore>, config).unwrap();
    (Arc::new(manager), store)
}

fn policy_with(config: RateLimitConfig) -> Arc<RateLimitPolicy> {
    Arc::new(
        RateLimitPolicy::new(
            Arc::new(InMemoryAttemptLedger::new()),
            Arc::new(InMemoryLockoutLedger::new()),
            config,
        )
        .unwrap(),
    )
}

/// One admitted, failed attempt.
async fn fail_once(policy: &RateLimitPolicy, identity: &str, ctx: &RequestContext) {
    let admission = policy.admit_attempt(identity, ctx).await.unwrap();
    assert!(admission.is_admitted(), "attempt unexpectedly denied");
    policy.record_attempt(identity, ctx, false).await.unwrap();
}

// =============================================================================
// Field encryption
// =============================================================================

#[test]
fn cipher_round_trips_and_randomizes() {
    let cipher = FieldCipher::new(&EncryptionKey::generate().unwrap());

    for plaintext in ["", "caseworker", "198.51.100.23", "Mozilla/5.0 ünïcödé"] {
        let a = cipher.encrypt_str(plaintext).unwrap();
        let b = cipher.encrypt_str(plaintext).unwrap();

        assert_ne!(a, b, "same plaintext must not produce the same payload");
        assert_eq!(cipher.decrypt_str(&a).unwrap().expose_secret(), plaintext);
        assert_eq!(cipher.decrypt_str(&b).unwrap().expose_secret(), plaintext);
    }
}

#[test]
fn cipher_detects_any_flipped_byte() {
    let cipher = FieldCipher::new(&EncryptionKey::generate().unwrap());
    let payload = cipher.encrypt(b"supervisor").unwrap();

    for i in 0..payload.len() {
        let mut tampered = payload.clone();
        tampered[i] ^= 0x01;
        assert_eq!(
            cipher.decrypt(&tampered).unwrap_err(),
            AuthError::DecryptionFailed,
            "byte {i} flipped but decryption succeeded"
        );
    }
}

#[test]
fn cipher_rejects_foreign_key() {
    let ours = FieldCipher::new(&EncryptionKey::generate().unwrap());
    let theirs = FieldCipher::new(&EncryptionKey::generate().unwrap());

    let payload = theirs.encrypt(b"analyst").unwrap();
    assert_eq!(ours.decrypt(&payload).unwrap_err(), AuthError::DecryptionFailed);
}

// =============================================================================
// Tokens
// =============================================================================

#[test]
fn tokens_are_unique_and_well_formed() {
    let tokens: HashSet<String> = (0..200)
        .map(|_| generate_token(32).unwrap().expose_secret().to_owned())
        .collect();

    assert_eq!(tokens.len(), 200);
    assert!(tokens.iter().all(|t| validate_token_format(t)));
}

#[test]
fn token_format_rejects_garbage() {
    assert!(!validate_token_format(""));
    assert!(!validate_token_format("short"));
    assert!(!validate_token_format("not base64 at all!!! not base64 at all!!!"));
    assert!(!validate_token_format(&"A".repeat(4096)));
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[tokio::test]
async fn refresh_rotates_identifier() {
    let (manager, _) = sessions_with(SessionConfig::default());
    let session = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let old_id = session.id.expose_secret().to_owned();

    let refreshed = manager.refresh_session(&old_id, &office()).await.unwrap();

    assert_ne!(refreshed.id.expose_secret(), old_id);
    assert_ne!(refreshed.csrf_token, session.csrf_token);
    assert_eq!(
        manager.validate_session(&old_id, &office()).await.unwrap_err(),
        AuthError::InvalidSession
    );

    let validated = manager
        .validate_session(refreshed.id.expose_secret(), &office())
        .await
        .unwrap();
    assert_eq!(validated.user_id, 7);
    assert_eq!(validated.role, "caseworker");
}

#[tokio::test]
async fn address_binding_invalidates_on_mismatch() {
    let (manager, store) = sessions_with(SessionConfig::default());
    let session = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let id = session.id.expose_secret();

    assert_eq!(
        manager.validate_session(id, &elsewhere()).await.unwrap_err(),
        AuthError::AddressMismatch
    );

    let stored = store.find(id).await.unwrap().unwrap();
    assert_eq!(stored.state(), SessionState::Invalidated);
    assert_eq!(
        stored.invalidation_reason,
        Some(InvalidationReason::SecurityViolation)
    );

    // the legitimate client is logged out too
    assert_eq!(
        manager.validate_session(id, &office()).await.unwrap_err(),
        AuthError::InvalidSession
    );
}

#[tokio::test]
async fn fingerprint_binding_invalidates_on_mismatch() {
    let (manager, _) = sessions_with(SessionConfig::default());
    let session = manager.create_session(7, "caseworker", &office()).await.unwrap();

    let other_browser = RequestContext::new(Some("192.0.2.10"), Some("curl/8.4.0"));
    assert_eq!(
        manager
            .validate_session(session.id.expose_secret(), &other_browser)
            .await
            .unwrap_err(),
        AuthError::FingerprintMismatch
    );
}

#[tokio::test]
async fn binding_can_be_disabled() {
    let (manager, _) = sessions_with(SessionConfig {
        bind_address: false,
        bind_fingerprint: false,
        ..Default::default()
    });
    let session = manager.create_session(7, "caseworker", &office()).await.unwrap();

    let roaming = RequestContext::new(Some("198.18.0.1"), Some("Mobile Safari"));
    assert!(
        manager
            .validate_session(session.id.expose_secret(), &roaming)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn csrf_accepts_only_the_session_token() {
    let (manager, _) = sessions_with(SessionConfig::default());
    let session = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let id = session.id.expose_secret();

    let ok = manager
        .validate_csrf_token(id, session.csrf_token.expose_secret(), &office())
        .await
        .unwrap();
    assert_eq!(ok.user_id, 7);

    let forged = generate_token(32).unwrap();
    assert_eq!(
        manager
            .validate_csrf_token(id, forged.expose_secret(), &office())
            .await
            .unwrap_err(),
        AuthError::InvalidCsrfToken
    );
}

#[tokio::test]
async fn csrf_rejects_empty_and_truncated_tokens() {
    let (manager, _) = sessions_with(SessionConfig::default());

    for bad in ["", "x"] {
        let session = manager.create_session(7, "caseworker", &office()).await.unwrap();
        let err = manager
            .validate_csrf_token(session.id.expose_secret(), bad, &office())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCsrfToken);
    }

    let session = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let token = session.csrf_token.expose_secret();
    let truncated = &token[..token.len() - 1];
    assert_eq!(
        manager
            .validate_csrf_token(session.id.expose_secret(), truncated, &office())
            .await
            .unwrap_err(),
        AuthError::InvalidCsrfToken
    );
}

#[tokio::test]
async fn session_limit_evicts_oldest() {
    let (manager, _) = sessions_with(SessionConfig {
        max_sessions_per_user: 2,
        ..Default::default()
    });

    let first = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let second = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let third = manager.create_session(7, "caseworker", &office()).await.unwrap();

    assert_eq!(
        manager
            .validate_session(first.id.expose_secret(), &office())
            .await
            .unwrap_err(),
        AuthError::InvalidSession
    );
    assert!(manager.validate_session(second.id.expose_secret(), &office()).await.is_ok());
    assert!(manager.validate_session(third.id.expose_secret(), &office()).await.is_ok());
    assert_eq!(manager.active_sessions(7).await.unwrap().len(), 2);
}

#[tokio::test]
async fn single_session_mode_keeps_only_newest() {
    let (manager, store) = sessions_with(SessionConfig {
        force_single_session: true,
        ..Default::default()
    });

    let first = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let second = manager.create_session(7, "caseworker", &office()).await.unwrap();

    let evicted = store.find(first.id.expose_secret()).await.unwrap().unwrap();
    assert_eq!(evicted.invalidation_reason, Some(InvalidationReason::SingleSession));
    assert!(manager.validate_session(second.id.expose_secret(), &office()).await.is_ok());
}

#[tokio::test]
async fn logout_everywhere() {
    let (manager, _) = sessions_with(SessionConfig::default());
    for _ in 0..3 {
        manager.create_session(7, "caseworker", &office()).await.unwrap();
    }
    let bystander = manager.create_session(8, "analyst", &office()).await.unwrap();

    let count = manager
        .invalidate_user_sessions(7, InvalidationReason::Custom("password_changed".to_owned()))
        .await
        .unwrap();

    assert_eq!(count, 3);
    assert!(manager.active_sessions(7).await.unwrap().is_empty());
    assert!(manager.validate_session(bystander.id.expose_secret(), &office()).await.is_ok());
}

#[tokio::test]
async fn malformed_identifiers_never_reach_the_store() {
    let (manager, _) = sessions_with(SessionConfig::default());

    let oversized = "A".repeat(1000);
    for bad in ["", "x", "'; DROP TABLE sessions; --", oversized.as_str()] {
        assert_eq!(
            manager.validate_session(bad, &office()).await.unwrap_err(),
            AuthError::InvalidSession
        );
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creation_yields_distinct_identifiers() {
    const K: i64 = 64;
    let (manager, store) = sessions_with(SessionConfig::default());

    let handles: Vec<_> = (0..K)
        .map(|user_id| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .create_session(user_id, "caseworker", &office())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        let session = handle.await.unwrap();
        ids.insert(session.id.expose_secret().to_owned());
    }

    assert_eq!(ids.len(), K as usize);
    assert_eq!(store.len(), K as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_has_one_winner() {
    let (manager, _) = sessions_with(SessionConfig::default());
    let session = manager.create_session(7, "caseworker", &office()).await.unwrap();
    let id = session.id.expose_secret().to_owned();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            tokio::spawn(async move { manager.refresh_session(&id, &office()).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e, AuthError::InvalidSession),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(manager.active_sessions(7).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_logins_respect_session_limit() {
    let (manager, _) = sessions_with(SessionConfig {
        max_sessions_per_user: 3,
        ..Default::default()
    });

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .create_session(7, "caseworker", &office())
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.active_sessions(7).await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admission_places_one_lockout() {
    let policy = policy_with(RateLimitConfig {
        max_attempts_per_identity: 3,
        ..Default::default()
    });
    for _ in 0..3 {
        fail_once(&policy, "dana@example.org", &office()).await;
    }

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let policy = Arc::clone(&policy);
            tokio::spawn(async move {
                policy
                    .admit_attempt("dana@example.org", &office())
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert!(!handle.await.unwrap().is_admitted());
    }

    let history = policy.lockout_history("dana@example.org", 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

// =============================================================================
// Brute-force defense
// =============================================================================

#[tokio::test]
async fn lockout_after_threshold() {
    const N: u32 = 4;
    let policy = policy_with(RateLimitConfig {
        max_attempts_per_identity: N,
        ..Default::default()
    });

    // the N-th failure is still admitted and recorded
    for _ in 0..N {
        fail_once(&policy, "erin@example.org", &office()).await;
    }
    assert_eq!(
        policy.recent_attempts("erin@example.org", 100).await.unwrap().len(),
        N as usize
    );

    let denied = policy.admit_attempt("erin@example.org", &office()).await.unwrap();
    assert!(!denied.is_admitted());
    assert!(denied.retry_after_secs().is_some_and(|s| s > 0));

    let history = policy.lockout_history("erin@example.org", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].unlocked_at.is_none());
    assert_eq!(history[0].failure_count, N);
}

#[tokio::test]
async fn progressive_backoff_doubles_until_ceiling() {
    let policy = policy_with(RateLimitConfig {
        max_attempts_per_identity: 2,
        base_lockout: Duration::minutes(30),
        backoff_multiplier: 2.0,
        max_lockout: Duration::minutes(100),
        ..Default::default()
    });

    let mut durations = Vec::new();
    for _ in 0..4 {
        for _ in 0..2 {
            fail_once(&policy, "frank@example.org", &office()).await;
        }
        let denied = policy.admit_attempt("frank@example.org", &office()).await.unwrap();
        assert!(!denied.is_admitted());

        let latest = policy.lockout_history("frank@example.org", 1).await.unwrap();
        durations.push(latest[0].duration_seconds);
        policy.unlock_identity("frank@example.org", Some(1)).await.unwrap();
    }

    assert_eq!(durations, vec![30 * 60, 60 * 60, 100 * 60, 100 * 60]);
}

#[tokio::test]
async fn whitelisted_address_is_never_denied() {
    let policy = policy_with(RateLimitConfig {
        max_attempts_per_identity: 2,
        max_attempts_per_address: 2,
        whitelist: BTreeSet::from(["192.0.2.10".to_owned()]),
        ..Default::default()
    });

    for _ in 0..25 {
        fail_once(&policy, "gail@example.org", &office()).await;
    }
    assert!(policy.lockout_history("gail@example.org", 10).await.unwrap().is_empty());

    // other addresses are still counted
    for _ in 0..2 {
        fail_once(&policy, "hal@example.org", &elsewhere()).await;
    }
    assert!(
        !policy
            .admit_attempt("hal@example.org", &elsewhere())
            .await
            .unwrap()
            .is_admitted()
    );
}

#[tokio::test]
async fn stripped_headers_share_one_bucket() {
    let policy = policy_with(RateLimitConfig {
        max_attempts_per_address: 3,
        ..Default::default()
    });
    let anonymous = RequestContext::new(None, None);

    for i in 0..3 {
        fail_once(&policy, &format!("user{i}@example.org"), &anonymous).await;
    }

    let denied = policy
        .admit_attempt("someone-else@example.org", &anonymous)
        .await
        .unwrap();
    match denied {
        custodia::Admission::Denied { lockout, .. } => {
            assert_eq!(lockout.kind, LockoutKind::Address);
            assert_eq!(lockout.address.as_deref(), Some("unknown"));
        }
        custodia::Admission::Admitted => panic!("address lockout expected"),
    }
}

#[tokio::test]
async fn manual_lockout_blocks_until_released() {
    let policy = policy_with(RateLimitConfig::default());

    policy
        .lock_manually(Some("hank@example.org"), None, "suspected compromise", None, Some(1))
        .await
        .unwrap();

    let denied = policy.admit_attempt("hank@example.org", &office()).await.unwrap();
    assert!(!denied.is_admitted());
    assert_eq!(denied.retry_after_secs(), None);

    assert_eq!(policy.unlock_identity("hank@example.org", Some(1)).await.unwrap(), 1);
    assert!(
        policy
            .admit_attempt("hank@example.org", &office())
            .await
            .unwrap()
            .is_admitted()
    );
}

// =============================================================================
// Authenticate flow
// =============================================================================

struct Deployment {
    action: AuthenticateAction,
    sessions: Arc<SessionManager>,
    audit: InMemoryAuditSink,
}

fn deployment(max_attempts: u32) -> Deployment {
    let hasher = Arc::new(Argon2Hasher::new(8192, 1, 1));
    let credentials = MockCredentialRepository::new();
    credentials.add_account(hasher.as_ref(), "ivy@example.org", 21, "supervisor", "correct horse");

    let audit = InMemoryAuditSink::new();
    let policy = Arc::new(
        RateLimitPolicy::new(
            Arc::new(InMemoryAttemptLedger::new()),
            Arc::new(InMemoryLockoutLedger::new()),
            RateLimitConfig {
                max_attempts_per_identity: max_attempts,
                ..Default::default()
            },
        )
        .unwrap()
        .with_audit_sink(Arc::new(audit.clone())),
    );
    let sessions = Arc::new(
        SessionManager::new(Arc::new(InMemorySessionStore::new()), SessionConfig::default())
            .unwrap()
            .with_audit_sink(Arc::new(audit.clone())),
    );

    Deployment {
        action: AuthenticateAction::new(
            Arc::new(credentials),
            hasher,
            policy,
            Arc::clone(&sessions),
        )
        .unwrap(),
        sessions,
        audit,
    }
}

#[tokio::test]
async fn login_then_session_is_usable() {
    let d = deployment(5);

    let session = d
        .action
        .execute("IVY@example.org", "correct horse", &office())
        .await
        .unwrap();

    assert_eq!(session.user_id, 21);
    assert!(
        d.sessions
            .validate_csrf_token(
                session.id.expose_secret(),
                session.csrf_token.expose_secret(),
                &office()
            )
            .await
            .is_ok()
    );
    assert_eq!(d.audit.count(AuditAction::LoginSucceeded), 1);
    assert_eq!(d.audit.count(AuditAction::SessionCreated), 1);
}

#[tokio::test]
async fn failures_are_indistinguishable_to_the_client() {
    let d = deployment(5);

    let wrong_password = d
        .action
        .execute("ivy@example.org", "battery staple", &office())
        .await
        .unwrap_err();
    let unknown_user = d
        .action
        .execute("nobody@example.org", "correct horse", &office())
        .await
        .unwrap_err();

    assert_eq!(wrong_password, unknown_user);
    assert_eq!(wrong_password.public_message(), unknown_user.public_message());
}

#[tokio::test]
async fn locked_out_user_cannot_log_in_with_right_password() {
    let d = deployment(3);

    for _ in 0..3 {
        d.action
            .execute("ivy@example.org", "guess", &office())
            .await
            .unwrap_err();
    }

    let err = d
        .action
        .execute("ivy@example.org", "correct horse", &office())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::RateLimited { .. }));
    assert_eq!(err.public_message(), AuthError::InvalidCredentials.public_message());
    assert_eq!(d.audit.count(AuditAction::LockoutCreated), 1);
    assert_eq!(d.audit.count(AuditAction::SessionCreated), 0);
}

#[tokio::test]
async fn audit_never_records_raw_session_identifiers() {
    let d = deployment(5);

    let session = d
        .action
        .execute("ivy@example.org", "correct horse", &office())
        .await
        .unwrap();
    let refreshed = d
        .sessions
        .refresh_session(session.id.expose_secret(), &office())
        .await
        .unwrap();
    d.sessions
        .invalidate_session(refreshed.id.expose_secret(), InvalidationReason::Logout)
        .await
        .unwrap();

    let raw = [session.id.expose_secret(), refreshed.id.expose_secret()];
    let entries = d.audit.entries();
    assert!(!entries.is_empty());
    for entry in &entries {
        let rendered = format!("{entry:?}");
        for id in raw {
            assert!(!rendered.contains(id), "raw session id leaked into {entry:?}");
        }
    }
    assert!(
        entries
            .iter()
            .any(|e| e.target.as_deref() == Some(session_ref(refreshed.id.expose_secret()).as_str()))
    );
}

// =============================================================================
// Failure paths
// =============================================================================

/// Session store whose writes can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: InMemorySessionStore,
    fail_insert: AtomicBool,
    fail_rotate: AtomicBool,
}

fn disk_error() -> AuthError {
    AuthError::DatabaseError("insert_session: disk I/O error".to_owned())
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn insert(
        &self,
        session: &Session,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(disk_error());
        }
        self.inner.insert(session, limit, now).await
    }

    async fn find(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        self.inner.find(session_id).await
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool, AuthError> {
        self.inner.touch(session_id, at).await
    }

    async fn invalidate(
        &self,
        session_id: &str,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        self.inner.invalidate(session_id, reason, at).await
    }

    async fn rotate(
        &self,
        old_id: &str,
        replacement: &Session,
        at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        if self.fail_rotate.load(Ordering::SeqCst) {
            return Err(AuthError::DatabaseError(
                "rotate_session: disk I/O error".to_owned(),
            ));
        }
        self.inner.rotate(old_id, replacement, at).await
    }

    async fn invalidate_user_sessions(
        &self,
        user_id: i64,
        reason: &InvalidationReason,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, AuthError> {
        self.inner.invalidate_user_sessions(user_id, reason, at).await
    }

    async fn active_sessions_for_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError> {
        self.inner.active_sessions_for_user(user_id, now).await
    }

    async fn invalidate_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        self.inner.invalidate_expired(now).await
    }

    async fn prune_invalidated(&self, before: DateTime<Utc>) -> Result<u64, AuthError> {
        self.inner.prune_invalidated(before).await
    }
}

/// Audit sink that rejects every entry.
struct BrokenAuditSink;

#[async_trait]
impl AuditSink for BrokenAuditSink {
    async fn record(&self, _entry: &AuditEntry) -> Result<(), AuthError> {
        Err(AuthError::Internal("audit backend unavailable".to_owned()))
    }
}

fn flaky_sessions() -> (SessionManager, Arc<FlakyStore>, InMemoryAuditSink) {
    let store = Arc::new(FlakyStore::default());
    let audit = InMemoryAuditSink::new();
    let manager = SessionManager::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        SessionConfig::default(),
    )
    .unwrap()
    .with_audit_sink(Arc::new(audit.clone()));
    (manager, store, audit)
}

#[tokio::test]
async fn failed_insert_fails_create_without_leaving_a_session() {
    let (manager, store, audit) = flaky_sessions();
    store.fail_insert.store(true, Ordering::SeqCst);

    assert_eq!(
        manager.create_session(31, "caseworker", &office()).await.unwrap_err(),
        disk_error()
    );
    assert!(store.inner.is_empty());
    assert!(manager.active_sessions(31).await.unwrap().is_empty());
    assert_eq!(audit.count(AuditAction::SessionCreated), 0);
}

#[tokio::test]
async fn failed_rotate_keeps_the_old_session_valid() {
    let (manager, store, audit) = flaky_sessions();
    let session = manager.create_session(31, "caseworker", &office()).await.unwrap();
    let id = session.id.expose_secret();
    store.fail_rotate.store(true, Ordering::SeqCst);

    assert!(matches!(
        manager.refresh_session(id, &office()).await.unwrap_err(),
        AuthError::DatabaseError(msg) if msg.starts_with("rotate_session")
    ));
    assert_eq!(audit.count(AuditAction::SessionRefreshed), 0);
    assert_eq!(store.inner.len(), 1);

    let still_valid = manager.validate_session(id, &office()).await.unwrap();
    assert_eq!(still_valid.user_id, 31);

    // once storage recovers the same session refreshes normally
    store.fail_rotate.store(false, Ordering::SeqCst);
    assert!(manager.refresh_session(id, &office()).await.is_ok());
}

#[tokio::test]
async fn broken_audit_sink_never_changes_session_outcomes() {
    let manager = SessionManager::new(
        Arc::new(InMemorySessionStore::new()),
        SessionConfig::default(),
    )
    .unwrap()
    .with_audit_sink(Arc::new(BrokenAuditSink));

    let session = manager.create_session(41, "analyst", &office()).await.unwrap();
    let id = session.id.expose_secret();

    assert_eq!(manager.validate_session(id, &office()).await.unwrap().user_id, 41);
    let refreshed = manager.refresh_session(id, &office()).await.unwrap();
    let refreshed_id = refreshed.id.expose_secret();

    assert_eq!(
        manager.validate_session(refreshed_id, &elsewhere()).await.unwrap_err(),
        AuthError::AddressMismatch
    );
    assert_eq!(
        manager.validate_session(refreshed_id, &office()).await.unwrap_err(),
        AuthError::InvalidSession
    );
}

#[tokio::test]
async fn broken_audit_sink_never_changes_rate_limit_outcomes() {
    let policy = RateLimitPolicy::new(
        Arc::new(InMemoryAttemptLedger::new()),
        Arc::new(InMemoryLockoutLedger::new()),
        RateLimitConfig {
            max_attempts_per_identity: 2,
            ..Default::default()
        },
    )
    .unwrap()
    .with_audit_sink(Arc::new(BrokenAuditSink));
    let ctx = office();

    fail_once(&policy, "jo@example.org", &ctx).await;
    fail_once(&policy, "jo@example.org", &ctx).await;

    let denied = policy.admit_attempt("jo@example.org", &ctx).await.unwrap();
    assert!(matches!(
        denied.ensure_admitted(),
        Err(AuthError::RateLimited { retry_after_secs: Some(_) })
    ));
    assert_eq!(policy.lockout_history("jo@example.org", 10).await.unwrap().len(), 1);

    let manual = policy
        .lock_manually(Some("kim@example.org"), None, "hold", None, Some(1))
        .await
        .unwrap();
    assert_eq!(manual.kind, LockoutKind::Manual);
    assert_eq!(policy.unlock_identity("kim@example.org", Some(1)).await.unwrap(), 1);
}
