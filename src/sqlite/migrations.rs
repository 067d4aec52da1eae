//! Embedded `SQLite` migrations.
//!
//! # Example
//!
//! ```rust,ignore
//! use custodia::sqlite::migrations;
//! use sqlx::SqlitePool;
//!
//! async fn setup_database(pool: &SqlitePool) -> Result<(), sqlx::Error> {
//!     migrations::run(pool).await?;
//!     Ok(())
//! }
//! ```

use sqlx::{Executor, SqlitePool};

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "20260901000001_create_sessions_table",
        include_str!("../../migrations_sqlite/20260901000001_create_sessions_table.sql"),
    ),
    (
        "20260901000002_create_login_attempts_table",
        include_str!("../../migrations_sqlite/20260901000002_create_login_attempts_table.sql"),
    ),
    (
        "20260901000003_create_account_lockouts_table",
        include_str!("../../migrations_sqlite/20260901000003_create_account_lockouts_table.sql"),
    ),
    (
        "20260901000004_create_rate_limit_config_table",
        include_str!(
            "../../migrations_sqlite/20260901000004_create_rate_limit_config_table.sql"
        ),
    ),
];

/// Applies every migration not yet recorded in `_custodia_migrations`.
pub async fn run(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    pool.execute(
        r"
        CREATE TABLE IF NOT EXISTS _custodia_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        ",
    )
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM _custodia_migrations WHERE name = ?)")
                .bind(*name)
                .fetch_one(pool)
                .await?;

        if applied {
            continue;
        }

        // NOTE: naive split; the bundled files keep semicolons out of literals
        let mut tx = pool.begin().await?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                (&mut *tx).execute(trimmed).await?;
            }
        }
        sqlx::query("INSERT INTO _custodia_migrations (name) VALUES (?)")
            .bind(*name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        log::info!(target: crate::LOG_TARGET, "msg=\"migration applied\", name=\"{name}\"");
    }

    Ok(())
}
