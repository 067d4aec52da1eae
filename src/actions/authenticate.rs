use std::sync::Arc;

use super::credentials::CredentialRepository;
use crate::crypto::PasswordHasher;
use crate::rate_limit::RateLimitPolicy;
use crate::session::{RequestContext, Session, SessionManager};
use crate::{AuthError, LOG_TARGET};

/// Verified against for unknown identities so both paths cost one hash.
const DUMMY_PASSWORD: &str = "custodia-timing-equalizer";

/// Turns a credential check into a session.
///
/// admit -> look up credentials -> verify hash -> record attempt -> create session.
/// Every failure the caller can observe is `InvalidCredentials` or
/// `RateLimited`; use [`AuthError::public_message`] when answering the client.
pub struct AuthenticateAction {
    credentials: Arc<dyn CredentialRepository>,
    hasher: Arc<dyn PasswordHasher>,
    rate_limit: Arc<RateLimitPolicy>,
    sessions: Arc<SessionManager>,
    dummy_hash: String,
}

impl AuthenticateAction {
    /// Hashes the dummy password up front, so every unknown-identity login
    /// costs exactly one verification.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::PasswordHashError` if the hasher cannot hash.
    pub fn new(
        credentials: Arc<dyn CredentialRepository>,
        hasher: Arc<dyn PasswordHasher>,
        rate_limit: Arc<RateLimitPolicy>,
        sessions: Arc<SessionManager>,
    ) -> Result<Self, AuthError> {
        let dummy_hash = hasher.hash(DUMMY_PASSWORD)?;
        Ok(Self {
            credentials,
            hasher,
            rate_limit,
            sessions,
            dummy_hash,
        })
    }

    fn burn_verification(&self, password: &str) {
        let _ = self.hasher.verify(password, &self.dummy_hash);
    }

    /// # Returns
    ///
    /// - `Ok(session)` - credentials verified and a session created
    /// - `Err(AuthError::RateLimited { .. })` - a lockout is active
    /// - `Err(AuthError::InvalidCredentials)` - unknown identity or wrong password
    /// - `Err(_)` - storage or hashing errors
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "authenticate", skip_all, err)
    )]
    pub async fn execute(
        &self,
        identity: &str,
        password: &str,
        ctx: &RequestContext,
    ) -> Result<Session, AuthError> {
        let admission = self.rate_limit.admit_attempt(identity, ctx).await?;
        if let Err(e) = admission.ensure_admitted() {
            // denied attempts stay in the forensic trail
            self.rate_limit.record_attempt(identity, ctx, false).await?;
            return Err(e);
        }

        let credentials = self.credentials.find_by_identity(identity.trim()).await?;

        let verified = match &credentials {
            Some(c) => match self.hasher.verify(password, &c.password_hash) {
                Ok(ok) => ok,
                Err(e) => {
                    self.rate_limit.record_attempt(identity, ctx, false).await?;
                    log::error!(
                        target: LOG_TARGET,
                        "msg=\"stored password hash unreadable\", user_id={}",
                        c.user_id
                    );
                    return Err(e);
                }
            },
            None => {
                self.burn_verification(password);
                false
            }
        };

        self.rate_limit
            .record_attempt(identity, ctx, verified)
            .await?;

        let Some(credentials) = credentials.filter(|_| verified) else {
            log::info!(target: LOG_TARGET, "msg=\"authentication failed\"");
            return Err(AuthError::InvalidCredentials);
        };

        let session = self
            .sessions
            .create_session(credentials.user_id, &credentials.role, ctx)
            .await?;

        log::info!(
            target: LOG_TARGET,
            "msg=\"authentication success\", user_id={}",
            credentials.user_id
        );

        Ok(session)
    }
}
