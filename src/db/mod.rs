mod quota_repo;
mod selection_repo;
mod user_repo;

#[cfg(test)]
pub mod testing;

pub use quota_repo::{QuotaScan, QuotaStore, SqliteQuotaStore};
pub use selection_repo::{SelectionRecord, SelectionRepository, SqliteSelectionRepository};
pub use user_repo::{SqliteUserDirectory, UserDirectory};

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    /// The row changed (or appeared) between read and conditional write.
    #[error("Write conflict for user {0}")]
    Conflict(i64),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Database configuration
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:data/daily_quota.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Create and configure a SQLite connection pool
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool, DbError> {
    // Ensure the data directory exists
    if let Some(db_path) = config.url.strip_prefix("sqlite:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DbError::Migration(format!("Failed to create database directory: {}", e))
                })?;
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&format!("{}?mode=rwc", config.url))
        .await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    let migration_001 = include_str!("../../migrations/001_create_tables.sql");
    sqlx::raw_sql(migration_001).execute(pool).await?;

    let migration_002 = include_str!("../../migrations/002_create_selection_histories.sql");
    sqlx::raw_sql(migration_002).execute(pool).await?;

    tracing::info!("Database migrations completed");
    Ok(())
}

pub(crate) fn to_unix(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn from_unix(secs: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DbError::Corrupt(format!("timestamp out of range: {}", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool() {
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        };
        let pool = create_pool(&config).await.expect("Failed to create pool");
        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
    }

    #[tokio::test]
    async fn test_migrations_are_rerunnable() {
        let pool = testing::memory_pool().await;
        run_migrations(&pool).await.unwrap();
    }

    #[test]
    fn test_unix_conversion() {
        let ts = from_unix(1_700_000_000).unwrap();
        assert_eq!(to_unix(ts), 1_700_000_000);
    }
}
