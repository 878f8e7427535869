use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::{ConsumeOutcome, Decision, QuotaRecord, QuotaStatus};
use super::policy::QuotaPolicy;
use crate::db::{DbError, QuotaScan, QuotaStore, UserDirectory};
use crate::error::HttpError;
use crate::impl_into_response;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("No quota record for user {0}")]
    NotFound(i64),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Quota for user {0} is under contention, try again")]
    Conflict(i64),

    #[error("Storage error: {0}")]
    Store(#[from] DbError),
}

impl HttpError for QuotaError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::UserNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Validation(_) => Some("VALIDATION_ERROR"),
            Self::NotFound(_) => Some("QUOTA_NOT_FOUND"),
            Self::UserNotFound(_) => Some("USER_NOT_FOUND"),
            Self::Conflict(_) => Some("WRITE_CONFLICT"),
            Self::Store(_) => Some("STORE_ERROR"),
        }
    }
}

impl_into_response!(QuotaError);

/// Tuning knobs for `QuotaService`
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Extra attempts after an optimistic write conflict
    pub max_conflict_retries: u32,
    /// Records fetched per page during full passes
    pub scan_page_size: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            scan_page_size: 500,
        }
    }
}

/// Orchestrates quota reads and writes.
///
/// Every read-modify-write for a user runs under that user's lock, and the
/// final write is conditional on the version read, so a concurrent writer in
/// another process surfaces as a conflict instead of a lost update.
pub struct QuotaService {
    store: Arc<dyn QuotaStore>,
    users: Arc<dyn UserDirectory>,
    policy: Arc<dyn QuotaPolicy>,
    options: ServiceOptions,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl QuotaService {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        users: Arc<dyn UserDirectory>,
        policy: Arc<dyn QuotaPolicy>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            store,
            users,
            policy,
            options,
            locks: DashMap::new(),
        }
    }

    async fn lock_user(&self, user_id: i64) -> UserGuard<'_> {
        let mutex = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        UserGuard {
            guard: Some(mutex.lock_owned().await),
            locks: &self.locks,
            user_id,
        }
    }

    /// Draw `amount` selections from a user's quota, creating the record on first use.
    pub async fn consume(
        &self,
        user_id: i64,
        amount: u32,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, QuotaError> {
        if amount == 0 {
            return Err(QuotaError::Validation(
                "amount must be a positive integer".to_string(),
            ));
        }
        let now = now.trunc_subsecs(0);
        let _guard = self.lock_user(user_id).await;

        let mut attempt = 0;
        loop {
            match self.consume_once(user_id, amount, now).await {
                Err(QuotaError::Store(DbError::Conflict(_)))
                    if attempt < self.options.max_conflict_retries =>
                {
                    attempt += 1;
                    tracing::debug!(user_id, attempt, "Quota write conflict, retrying");
                }
                Err(QuotaError::Store(DbError::Conflict(_))) => {
                    tracing::warn!(user_id, attempts = attempt + 1, "Quota write conflict persisted");
                    metrics::counter!("quota_consume_total", "outcome" => "conflict").increment(1);
                    return Err(QuotaError::Conflict(user_id));
                }
                Err(e) => {
                    metrics::counter!("quota_consume_total", "outcome" => "error").increment(1);
                    return Err(e);
                }
                Ok(outcome) => {
                    let label = if outcome.is_allowed() { "allowed" } else { "denied" };
                    metrics::counter!("quota_consume_total", "outcome" => label).increment(1);
                    return Ok(outcome);
                }
            }
        }
    }

    async fn consume_once(
        &self,
        user_id: i64,
        amount: u32,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, QuotaError> {
        let (current, is_new) = match self.store.get(user_id).await? {
            Some(record) => (record, false),
            None => {
                if !self.users.user_exists(user_id).await? {
                    return Err(QuotaError::UserNotFound(user_id));
                }
                tracing::info!(user_id, "Creating quota record on first use");
                (self.policy.new_record(user_id, now), true)
            }
        };

        if amount > current.capacity {
            return Err(QuotaError::Validation(format!(
                "amount {} exceeds capacity {}",
                amount, current.capacity
            )));
        }

        let (next, decision) = self.policy.try_consume(&current, now, amount);

        if is_new {
            self.store.insert(&next).await?;
        } else if next != current {
            self.write_back(&current, next.clone()).await?;
        }

        match decision {
            Decision::Allowed { remaining } => {
                tracing::debug!(user_id, amount, remaining, "Quota consumed");
                Ok(ConsumeOutcome::Allowed { remaining })
            }
            Decision::Denied(reason) => {
                tracing::debug!(user_id, amount, reason = ?reason, "Quota denied");
                Ok(ConsumeOutcome::Denied {
                    reason,
                    record: next,
                })
            }
        }
    }

    /// Conditional write of `next` over `current`, bumping the version
    async fn write_back(
        &self,
        current: &QuotaRecord,
        mut next: QuotaRecord,
    ) -> Result<QuotaRecord, DbError> {
        next.version = current.version + 1;
        self.store.compare_and_swap(&next, current.version).await?;
        Ok(next)
    }

    /// Give back `amount` units drawn at `drawn_at` that went unused.
    ///
    /// Only the window the units came from is credited; once it has been
    /// replaced this is a no-op. Returns whether anything was written.
    pub async fn refund(
        &self,
        user_id: i64,
        amount: u32,
        drawn_at: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        let drawn_at = drawn_at.trunc_subsecs(0);
        let _guard = self.lock_user(user_id).await;

        let mut attempt = 0;
        loop {
            let Some(current) = self.store.get(user_id).await? else {
                return Ok(false);
            };
            if drawn_at < current.window_start || current.is_expired(drawn_at) {
                return Ok(false);
            }

            let mut next = current.clone();
            next.remaining = current.remaining.saturating_add(amount).min(current.capacity);
            if next == current {
                return Ok(false);
            }

            match self.write_back(&current, next).await {
                Ok(written) => {
                    tracing::info!(user_id, amount, remaining = written.remaining, "Quota refunded");
                    return Ok(true);
                }
                Err(DbError::Conflict(_)) if attempt < self.options.max_conflict_retries => {
                    attempt += 1;
                }
                Err(DbError::Conflict(_)) => return Err(QuotaError::Conflict(user_id)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Replenish every record whose window has elapsed. Returns the number reset.
    pub async fn reset_all_due(&self, now: DateTime<Utc>) -> Result<usize, QuotaError> {
        let now = now.trunc_subsecs(0);
        let mut scan = QuotaScan::new(self.store.as_ref(), self.options.scan_page_size);
        let mut scanned = 0usize;
        let mut reset = 0usize;
        let mut failed = 0usize;

        while let Some(item) = scan.next().await {
            let listed = item?;
            scanned += 1;
            let record = match listed.record {
                Ok(record) => record,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(user_id = listed.user_id, error = %e, "Unreadable quota record, skipping");
                    continue;
                }
            };
            if !record.is_expired(now) {
                continue;
            }

            match self.reset_listed(record.user_id, now).await {
                Ok(true) => reset += 1,
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    tracing::warn!(user_id = record.user_id, error = %e, "Failed to reset quota, skipping");
                }
            }
        }

        metrics::counter!("quota_reset_total").increment(reset as u64);
        tracing::info!(scanned, reset, failed, "Quota reset pass finished");
        Ok(reset)
    }

    /// Re-read and reset one record from a full pass. `Ok(false)` if it no longer needs it.
    async fn reset_listed(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool, QuotaError> {
        let _guard = self.lock_user(user_id).await;
        let Some(current) = self.store.get(user_id).await? else {
            return Ok(false);
        };
        let next = self.policy.compute_reset(&current, now);
        if next == current {
            return Ok(false);
        }
        self.write_back(&current, next).await?;
        Ok(true)
    }

    /// Reset a single user's quota on demand
    pub async fn reset_one(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaRecord, QuotaError> {
        let now = now.trunc_subsecs(0);
        let _guard = self.lock_user(user_id).await;

        let mut attempt = 0;
        loop {
            let current = self
                .store
                .get(user_id)
                .await?
                .ok_or(QuotaError::NotFound(user_id))?;
            let next = self.policy.compute_reset(&current, now);
            if next == current {
                return Ok(current);
            }

            match self.write_back(&current, next).await {
                Ok(written) => {
                    tracing::info!(user_id, "Quota reset on demand");
                    return Ok(written);
                }
                Err(DbError::Conflict(_)) if attempt < self.options.max_conflict_retries => {
                    attempt += 1;
                }
                Err(DbError::Conflict(_)) => return Err(QuotaError::Conflict(user_id)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current quota as it would be seen by the next request
    pub async fn status(&self, user_id: i64, now: DateTime<Utc>) -> Result<QuotaStatus, QuotaError> {
        let now = now.trunc_subsecs(0);
        let stored = match self.store.get(user_id).await? {
            Some(record) => record,
            None => {
                if !self.users.user_exists(user_id).await? {
                    return Err(QuotaError::UserNotFound(user_id));
                }
                self.policy.new_record(user_id, now)
            }
        };
        let state = self.policy.state(&stored, now);
        let effective = self.policy.compute_reset(&stored, now);

        Ok(QuotaStatus {
            user_id,
            state,
            remaining: effective.remaining,
            capacity: effective.capacity,
            window_start: effective.window_start,
            window_end: effective.window_end,
            last_reset_at: effective.last_reset_at,
        })
    }

    /// Create default records for users that have none. Returns the number created.
    pub async fn provision_missing(&self, now: DateTime<Utc>) -> Result<usize, QuotaError> {
        let now = now.trunc_subsecs(0);
        let page_size = self.options.scan_page_size.max(1);
        let mut cursor = None;
        let mut created = 0usize;

        loop {
            let ids = self.users.list_user_ids(cursor, page_size).await?;
            let Some(&last) = ids.last() else {
                break;
            };
            cursor = Some(last);

            for user_id in &ids {
                let _guard = self.lock_user(*user_id).await;
                match self.store.get(*user_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => match self.store.insert(&self.policy.new_record(*user_id, now)).await {
                        Ok(()) => created += 1,
                        Err(DbError::Conflict(_)) => {}
                        Err(e) => {
                            tracing::warn!(user_id, error = %e, "Failed to provision quota record")
                        }
                    },
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "Failed to read quota record")
                    }
                }
            }

            if (ids.len() as u32) < page_size {
                break;
            }
        }

        if created > 0 {
            tracing::info!(created, "Provisioned missing quota records");
        }
        Ok(created)
    }
}

/// Holds a user's lock and drops the table entry once nobody else wants it
struct UserGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<i64, Arc<Mutex<()>>>,
    user_id: i64,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table itself holds the mutex now
        self.locks
            .remove_if(&self.user_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
