use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;

use super::{from_unix, to_unix, DbError};

/// One candidate shown to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRecord {
    pub id: i64,
    pub user_id: i64,
    pub candidate_id: i64,
    pub selected_at: DateTime<Utc>,
}

/// Append-only selection history
#[async_trait]
pub trait SelectionRepository: Send + Sync {
    async fn record(
        &self,
        user_id: i64,
        candidate_id: i64,
        selected_at: DateTime<Utc>,
    ) -> Result<SelectionRecord, DbError>;

    /// Most recent selections first
    async fn list_for_user(&self, user_id: i64, limit: u32)
        -> Result<Vec<SelectionRecord>, DbError>;
}

/// SQLite implementation of SelectionRepository
pub struct SqliteSelectionRepository {
    pool: SqlitePool,
}

impl SqliteSelectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SelectionRow {
    id: i64,
    user_id: i64,
    candidate_id: i64,
    selected_at: i64,
}

#[async_trait]
impl SelectionRepository for SqliteSelectionRepository {
    async fn record(
        &self,
        user_id: i64,
        candidate_id: i64,
        selected_at: DateTime<Utc>,
    ) -> Result<SelectionRecord, DbError> {
        let result = sqlx::query(
            "INSERT INTO selection_histories (user_id, candidate_id, selected_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(candidate_id)
        .bind(to_unix(selected_at))
        .execute(&self.pool)
        .await?;

        Ok(SelectionRecord {
            id: result.last_insert_rowid(),
            user_id,
            candidate_id,
            selected_at: from_unix(to_unix(selected_at))?,
        })
    }

    async fn list_for_user(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<SelectionRecord>, DbError> {
        let rows: Vec<SelectionRow> = sqlx::query_as(
            "SELECT id, user_id, candidate_id, selected_at FROM selection_histories
             WHERE user_id = ? ORDER BY selected_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SelectionRecord {
                    id: row.id,
                    user_id: row.user_id,
                    candidate_id: row.candidate_id,
                    selected_at: from_unix(row.selected_at)?,
                })
            })
            .collect()
    }
}
