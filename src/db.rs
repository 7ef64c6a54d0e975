use crate::constants::DB_BUSY_TIMEOUT_MS;
use crate::types::{now_timestamp, LumenError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(LumenError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let options = SqliteConnectOptions::from_str(&url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS as u64))
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(LumenError::internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(&pool).await;

    if let Err(e) = cleanup_expired_credentials(&pool).await {
        tracing::warn!("Database cleanup failed: {}", e);
    }

    Ok(pool)
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Drops refresh tokens and password resets that can no longer be redeemed.
pub async fn cleanup_expired_credentials(
    pool: &DbPool,
) -> std::result::Result<(u64, u64), sqlx::Error> {
    let now = now_timestamp();

    let deleted_tokens =
        sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ? OR revoked = 1")
            .bind(&now)
            .execute(pool)
            .await?
            .rows_affected();

    let deleted_resets =
        sqlx::query("DELETE FROM password_resets WHERE expires_at < ? OR used = 1")
            .bind(&now)
            .execute(pool)
            .await?
            .rows_affected();

    if deleted_tokens > 0 || deleted_resets > 0 {
        tracing::info!(
            "Cleanup complete: removed {} refresh tokens and {} password resets.",
            deleted_tokens,
            deleted_resets
        );
    }

    Ok((deleted_tokens, deleted_resets))
}
