use std::collections::VecDeque;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::quota::QuotaRecord;

use super::{from_unix, to_unix, DbError};

/// Persistence for per-user quota records
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Get the record for a user
    async fn get(&self, user_id: i64) -> Result<Option<QuotaRecord>, DbError>;

    /// Insert or replace the record for `record.user_id`
    async fn upsert(&self, record: &QuotaRecord) -> Result<(), DbError>;

    /// Create a record; fails with `DbError::Conflict` if one already exists
    async fn insert(&self, record: &QuotaRecord) -> Result<(), DbError>;

    /// Replace the record only if the stored version is `expected_version`
    async fn compare_and_swap(
        &self,
        record: &QuotaRecord,
        expected_version: i64,
    ) -> Result<(), DbError>;

    /// Records ordered by user id, starting after `after_user_id`.
    ///
    /// A row that cannot be decoded is returned as a failed entry; only a
    /// failed read fails the whole page.
    async fn list_page(
        &self,
        after_user_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ListedQuota>, DbError>;

    /// Get the total count of records
    async fn count(&self) -> Result<usize, DbError>;
}

/// One entry of a page listing
#[derive(Debug)]
pub struct ListedQuota {
    pub user_id: i64,
    pub record: Result<QuotaRecord, DbError>,
}

/// Lazy walk over every record in a store, one page at a time.
///
/// No snapshot is held between pages; start a new scan to restart.
pub struct QuotaScan<'a> {
    store: &'a dyn QuotaStore,
    page_size: u32,
    cursor: Option<i64>,
    buffer: VecDeque<ListedQuota>,
    exhausted: bool,
}

impl<'a> QuotaScan<'a> {
    pub fn new(store: &'a dyn QuotaStore, page_size: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next entry, or `None` once the store has been walked.
    ///
    /// The cursor moves past undecodable rows, so they never stall the walk.
    pub async fn next(&mut self) -> Option<Result<ListedQuota, DbError>> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.list_page(self.cursor, self.page_size).await {
                Ok(page) => {
                    if (page.len() as u32) < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.cursor = Some(last.user_id);
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// SQLite implementation of QuotaStore
pub struct SqliteQuotaStore {
    pool: SqlitePool,
}

impl SqliteQuotaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: QuotaRow) -> Result<QuotaRecord, DbError> {
        let remaining = u32::try_from(row.remaining)
            .map_err(|_| DbError::Corrupt(format!("remaining = {}", row.remaining)))?;
        let capacity = u32::try_from(row.capacity)
            .map_err(|_| DbError::Corrupt(format!("capacity = {}", row.capacity)))?;

        Ok(QuotaRecord {
            user_id: row.user_id,
            remaining,
            capacity,
            window_start: from_unix(row.window_start)?,
            window_end: from_unix(row.window_end)?,
            last_reset_at: from_unix(row.last_reset_at)?,
            version: row.version,
        })
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }
}

/// Internal row structure for SQLite queries
#[derive(sqlx::FromRow)]
struct QuotaRow {
    user_id: i64,
    remaining: i64,
    capacity: i64,
    window_start: i64,
    window_end: i64,
    last_reset_at: i64,
    version: i64,
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn get(&self, user_id: i64) -> Result<Option<QuotaRecord>, DbError> {
        let row: Option<QuotaRow> = sqlx::query_as(
            "SELECT user_id, remaining, capacity, window_start, window_end, last_reset_at, version
             FROM daily_quotas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn upsert(&self, record: &QuotaRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO daily_quotas (user_id, remaining, capacity, window_start, window_end, last_reset_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                remaining = excluded.remaining,
                capacity = excluded.capacity,
                window_start = excluded.window_start,
                window_end = excluded.window_end,
                last_reset_at = excluded.last_reset_at,
                version = excluded.version",
        )
        .bind(record.user_id)
        .bind(record.remaining as i64)
        .bind(record.capacity as i64)
        .bind(to_unix(record.window_start))
        .bind(to_unix(record.window_end))
        .bind(to_unix(record.last_reset_at))
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert(&self, record: &QuotaRecord) -> Result<(), DbError> {
        let result = sqlx::query(
            "INSERT INTO daily_quotas (user_id, remaining, capacity, window_start, window_end, last_reset_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.user_id)
        .bind(record.remaining as i64)
        .bind(record.capacity as i64)
        .bind(to_unix(record.window_start))
        .bind(to_unix(record.window_end))
        .bind(to_unix(record.last_reset_at))
        .bind(record.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if Self::is_unique_violation(&e) => Err(DbError::Conflict(record.user_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_and_swap(
        &self,
        record: &QuotaRecord,
        expected_version: i64,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            "UPDATE daily_quotas SET
                remaining = ?,
                capacity = ?,
                window_start = ?,
                window_end = ?,
                last_reset_at = ?,
                version = ?
             WHERE user_id = ? AND version = ?",
        )
        .bind(record.remaining as i64)
        .bind(record.capacity as i64)
        .bind(to_unix(record.window_start))
        .bind(to_unix(record.window_end))
        .bind(to_unix(record.last_reset_at))
        .bind(record.version)
        .bind(record.user_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Conflict(record.user_id));
        }
        Ok(())
    }

    async fn list_page(
        &self,
        after_user_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ListedQuota>, DbError> {
        let rows: Vec<QuotaRow> = sqlx::query_as(
            "SELECT user_id, remaining, capacity, window_start, window_end, last_reset_at, version
             FROM daily_quotas WHERE user_id > ? ORDER BY user_id LIMIT ?",
        )
        .bind(after_user_id.unwrap_or(i64::MIN))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ListedQuota {
                user_id: row.user_id,
                record: Self::row_to_record(row),
            })
            .collect())
    }

    async fn count(&self) -> Result<usize, DbError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM daily_quotas")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0 as usize)
    }
}
