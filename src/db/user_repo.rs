use async_trait::async_trait;
use sqlx::SqlitePool;

use super::DbError;

/// Read-only view of the account side's users
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: i64) -> Result<bool, DbError>;

    /// User ids in ascending order, starting after `after_user_id`
    async fn list_user_ids(&self, after_user_id: Option<i64>, limit: u32)
        -> Result<Vec<i64>, DbError>;
}

/// SQLite implementation of UserDirectory
pub struct SqliteUserDirectory {
    pool: SqlitePool,
}

impl SqliteUserDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn user_exists(&self, user_id: i64) -> Result<bool, DbError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0 > 0)
    }

    async fn list_user_ids(
        &self,
        after_user_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<i64>, DbError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT user_id FROM users WHERE user_id > ? ORDER BY user_id LIMIT ?")
                .bind(after_user_id.unwrap_or(i64::MIN))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
