use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::db_error;
use crate::config::RateLimitConfig;
use crate::rate_limit::RateLimitConfigRepository;
use crate::{AuthError, LOG_TARGET};

/// Stores the rate-limit settings as one JSON row.
#[derive(Clone)]
pub struct SqliteRateLimitConfigRepository {
    pool: SqlitePool,
}

impl SqliteRateLimitConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitConfigRepository for SqliteRateLimitConfigRepository {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), err))]
    async fn load(&self) -> Result<Option<RateLimitConfig>, AuthError> {
        let settings: Option<String> =
            sqlx::query_scalar("SELECT settings FROM rate_limit_config WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("load_rate_limit_config", &e))?;

        settings
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    log::error!(target: LOG_TARGET, "msg=\"stored rate limit config unreadable\", error=\"{e}\"");
                    AuthError::ConfigurationError(e.to_string())
                })
            })
            .transpose()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, err))]
    async fn save(&self, config: &RateLimitConfig) -> Result<(), AuthError> {
        let settings = serde_json::to_string(config)
            .map_err(|e| AuthError::Internal(format!("serialize rate limit config: {e}")))?;

        sqlx::query(
            r"INSERT INTO rate_limit_config (id, settings, updated_at)
               VALUES (1, ?, ?)
               ON CONFLICT(id) DO UPDATE SET settings = excluded.settings,
                                             updated_at = excluded.updated_at",
        )
        .bind(settings)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("save_rate_limit_config", &e))?;

        Ok(())
    }
}
