use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::AuthError;
use crate::config::RateLimitConfig;

/// Persistence for the singleton [`RateLimitConfig`].
#[async_trait]
pub trait RateLimitConfigRepository: Send + Sync {
    /// `None` until a configuration has been saved.
    async fn load(&self) -> Result<Option<RateLimitConfig>, AuthError>;

    async fn save(&self, config: &RateLimitConfig) -> Result<(), AuthError>;
}

#[derive(Clone, Default)]
pub struct InMemoryRateLimitConfigRepository {
    config: Arc<RwLock<Option<RateLimitConfig>>>,
}

impl InMemoryRateLimitConfigRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitConfigRepository for InMemoryRateLimitConfigRepository {
    async fn load(&self) -> Result<Option<RateLimitConfig>, AuthError> {
        Ok(self
            .config
            .read()
            .map_err(|_| AuthError::storage("load_rate_limit_config", "lock poisoned"))?
            .clone())
    }

    async fn save(&self, config: &RateLimitConfig) -> Result<(), AuthError> {
        *self
            .config
            .write()
            .map_err(|_| AuthError::storage("save_rate_limit_config", "lock poisoned"))? =
            Some(config.clone());
        Ok(())
    }
}
