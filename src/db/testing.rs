//! Test doubles and fixtures for the storage layer

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::quota::QuotaRecord;

use super::quota_repo::ListedQuota;
use super::{
    create_pool, run_migrations, DbConfig, DbError, QuotaStore, SelectionRecord,
    SelectionRepository, UserDirectory,
};

pub async fn memory_pool() -> SqlitePool {
    let config = DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    };
    let pool = create_pool(&config).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Insert users `1..=count`
pub async fn seed_users(pool: &SqlitePool, count: i64) {
    for id in 1..=count {
        sqlx::query("INSERT INTO users (user_id, username) VALUES (?, ?)")
            .bind(id)
            .bind(format!("user{}", id))
            .execute(pool)
            .await
            .unwrap();
    }
}

/// In-memory quota store with failure injection
#[derive(Default)]
pub struct MemoryQuotaStore {
    records: Mutex<BTreeMap<i64, QuotaRecord>>,
    failing_writes: Mutex<HashSet<i64>>,
    /// Number of upcoming conditional writes to reject with `Conflict`
    forced_conflicts: AtomicUsize,
    fail_listing: Mutex<bool>,
    list_delay: Mutex<Option<Duration>>,
    active_lists: AtomicUsize,
    max_active_lists: AtomicUsize,
    pub writes: AtomicUsize,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = QuotaRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock().unwrap();
            for record in records {
                map.insert(record.user_id, record);
            }
        }
        store
    }

    pub fn fail_writes_for(&self, user_id: i64) {
        self.failing_writes.lock().unwrap().insert(user_id);
    }

    pub fn force_conflicts(&self, count: usize) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn fail_listing(&self) {
        *self.fail_listing.lock().unwrap() = true;
    }

    pub fn delay_listing(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of `list_page` calls observed in flight at once
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_active_lists.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, user_id: i64) -> Option<QuotaRecord> {
        self.records.lock().unwrap().get(&user_id).cloned()
    }

    fn check_write(&self, user_id: i64) -> Result<(), DbError> {
        if self.failing_writes.lock().unwrap().contains(&user_id) {
            return Err(DbError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn get(&self, user_id: i64) -> Result<Option<QuotaRecord>, DbError> {
        Ok(self.snapshot(user_id))
    }

    async fn upsert(&self, record: &QuotaRecord) -> Result<(), DbError> {
        self.check_write(record.user_id)?;
        self.records
            .lock()
            .unwrap()
            .insert(record.user_id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(&self, record: &QuotaRecord) -> Result<(), DbError> {
        self.check_write(record.user_id)?;
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.user_id) {
            return Err(DbError::Conflict(record.user_id));
        }
        records.insert(record.user_id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        record: &QuotaRecord,
        expected_version: i64,
    ) -> Result<(), DbError> {
        self.check_write(record.user_id)?;
        if self.take_forced_conflict() {
            return Err(DbError::Conflict(record.user_id));
        }
        let mut records = self.records.lock().unwrap();
        match records.get(&record.user_id) {
            Some(current) if current.version == expected_version => {
                records.insert(record.user_id, record.clone());
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(DbError::Conflict(record.user_id)),
        }
    }

    async fn list_page(
        &self,
        after_user_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ListedQuota>, DbError> {
        let active = self.active_lists.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_lists.fetch_max(active, Ordering::SeqCst);

        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if *self.fail_listing.lock().unwrap() {
            Err(DbError::Sqlx(sqlx::Error::PoolTimedOut))
        } else {
            let records = self.records.lock().unwrap();
            Ok(records
                .range(after_user_id.map_or(i64::MIN, |id| id.saturating_add(1))..)
                .take(limit as usize)
                .map(|(&user_id, r)| ListedQuota {
                    user_id,
                    record: Ok(r.clone()),
                })
                .collect())
        };

        self.active_lists.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn count(&self) -> Result<usize, DbError> {
        Ok(self.records.lock().unwrap().len())
    }
}

/// Fixed set of known users
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: BTreeSet<i64>,
}

impl MemoryUserDirectory {
    pub fn with_users(users: impl IntoIterator<Item = i64>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn user_exists(&self, user_id: i64) -> Result<bool, DbError> {
        Ok(self.users.contains(&user_id))
    }

    async fn list_user_ids(
        &self,
        after_user_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<i64>, DbError> {
        Ok(self
            .users
            .range(after_user_id.map_or(i64::MIN, |id| id.saturating_add(1))..)
            .take(limit as usize)
            .copied()
            .collect())
    }
}

/// Selection history whose writes always fail
pub struct FailingSelectionRepository;

#[async_trait]
impl SelectionRepository for FailingSelectionRepository {
    async fn record(
        &self,
        _user_id: i64,
        _candidate_id: i64,
        _selected_at: DateTime<Utc>,
    ) -> Result<SelectionRecord, DbError> {
        Err(DbError::Sqlx(sqlx::Error::PoolTimedOut))
    }

    async fn list_for_user(
        &self,
        _user_id: i64,
        _limit: u32,
    ) -> Result<Vec<SelectionRecord>, DbError> {
        Ok(Vec::new())
    }
}
