use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobBuilder, JobScheduler};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::quota::{QuotaError, QuotaService};

use super::jobs::{RunSummary, Trigger};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Scheduler interval must be greater than zero")]
    InvalidInterval,

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// Runs reset passes one at a time
struct ResetRunner {
    quota_service: Arc<QuotaService>,
    /// Held for the whole pass; a firing that arrives mid-pass waits on it
    flight: Mutex<()>,
    running: AtomicBool,
    last_run: RwLock<Option<RunSummary>>,
}

impl ResetRunner {
    async fn run(&self) -> Result<RunSummary, QuotaError> {
        let _flight = self.flight.lock().await;
        self.running.store(true, Ordering::SeqCst);

        let started_at = Utc::now();
        let result = self.pass(started_at).await;
        let finished_at = Utc::now();

        let summary = match &result {
            Ok((provisioned, reset)) => RunSummary {
                started_at,
                finished_at,
                provisioned: *provisioned,
                reset: *reset,
                error: None,
            },
            Err(e) => RunSummary {
                started_at,
                finished_at,
                provisioned: 0,
                reset: 0,
                error: Some(e.to_string()),
            },
        };

        if let Ok(mut last) = self.last_run.write() {
            *last = Some(summary.clone());
        }
        self.running.store(false, Ordering::SeqCst);

        result.map(|_| summary)
    }

    async fn pass(&self, now: chrono::DateTime<Utc>) -> Result<(usize, usize), QuotaError> {
        let provisioned = self.quota_service.provision_missing(now).await?;
        let reset = self.quota_service.reset_all_due(now).await?;
        Ok((provisioned, reset))
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub started: bool,
    pub running: bool,
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunSummary>,
}

/// Owns the recurring quota reset job
pub struct QuotaScheduler {
    scheduler: JobScheduler,
    runner: Arc<ResetRunner>,
    trigger: Trigger,
    started: AtomicBool,
    job_id: RwLock<Option<Uuid>>,
}

impl QuotaScheduler {
    pub async fn new(
        quota_service: Arc<QuotaService>,
        trigger: Trigger,
    ) -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            runner: Arc::new(ResetRunner {
                quota_service,
                flight: Mutex::new(()),
                running: AtomicBool::new(false),
                last_run: RwLock::new(None),
            }),
            trigger,
            started: AtomicBool::new(false),
            job_id: RwLock::new(None),
        })
    }

    /// Register the reset job and start firing. Only the first call succeeds.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyStarted);
        }

        let job = self.build_job()?;
        let uuid = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        if let Ok(mut job_id) = self.job_id.write() {
            *job_id = Some(uuid);
        }

        self.scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        tracing::info!(trigger = %self.trigger, job_id = %uuid, "Quota reset scheduler started");
        Ok(())
    }

    /// Stop firing. A pass already running is left to finish.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        tracing::info!("Quota reset scheduler stopped");
        Ok(())
    }

    /// Run a pass immediately, waiting for any pass already in flight
    pub async fn run_now(&self) -> Result<RunSummary, QuotaError> {
        tracing::info!("Running manual quota reset pass");
        self.runner.run().await
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            started: self.started.load(Ordering::SeqCst),
            running: self.runner.running.load(Ordering::SeqCst),
            trigger: self.trigger.to_string(),
            job_id: self
                .job_id
                .read()
                .ok()
                .and_then(|id| id.map(|u| u.to_string())),
            last_run: self.runner.last_run.read().ok().and_then(|r| r.clone()),
        }
    }

    fn build_job(&self) -> Result<Job, SchedulerError> {
        let runner = Arc::clone(&self.runner);

        match &self.trigger {
            Trigger::Every(period) => {
                Job::new_repeated_async(*period, move |_uuid, _lock| {
                    scheduled_pass(Arc::clone(&runner))
                })
                .map_err(|e| SchedulerError::Scheduler(e.to_string()))
            }
            Trigger::Cron {
                expression,
                timezone,
            } => JobBuilder::new()
                .with_timezone(*timezone)
                .with_cron_job_type()
                .with_schedule(expression)
                .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?
                .with_run_async(Box::new(move |_uuid, _lock| {
                    scheduled_pass(Arc::clone(&runner))
                }))
                .build()
                .map_err(|e| SchedulerError::Scheduler(e.to_string())),
        }
    }
}

/// Body of every scheduled firing. Failures are logged; the schedule keeps going.
fn scheduled_pass(runner: Arc<ResetRunner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tracing::info!("Executing daily quota reset");
        match runner.run().await {
            Ok(summary) => tracing::info!(
                provisioned = summary.provisioned,
                reset = summary.reset,
                "Daily quota reset completed"
            ),
            Err(e) => tracing::error!(error = %e, "Daily quota reset failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{MemoryQuotaStore, MemoryUserDirectory};
    use crate::quota::{FixedWindowPolicy, QuotaRecord, ServiceOptions};
    use std::time::Duration;

    fn expired_record(user_id: i64) -> QuotaRecord {
        let end = Utc::now() - chrono::Duration::hours(1);
        QuotaRecord {
            user_id,
            remaining: 0,
            capacity: 3,
            window_start: end - chrono::Duration::hours(24),
            window_end: end,
            last_reset_at: end - chrono::Duration::hours(24),
            version: 0,
        }
    }

    async fn scheduler_with(store: Arc<MemoryQuotaStore>, trigger: Trigger) -> QuotaScheduler {
        let service = Arc::new(QuotaService::new(
            store,
            Arc::new(MemoryUserDirectory::with_users([1, 2, 3])),
            Arc::new(FixedWindowPolicy::new(3, chrono::Duration::hours(24))),
            ServiceOptions::default(),
        ));
        QuotaScheduler::new(service, trigger).await.unwrap()
    }

    #[tokio::test]
    async fn test_run_now_provisions_and_resets() {
        let store = Arc::new(MemoryQuotaStore::with_records([expired_record(1)]));
        let scheduler =
            scheduler_with(store.clone(), Trigger::Every(Duration::from_secs(86400))).await;

        let summary = scheduler.run_now().await.unwrap();
        assert_eq!(summary.provisioned, 2);
        assert_eq!(summary.reset, 1);
        assert_eq!(store.snapshot(1).unwrap().remaining, 3);

        let status = scheduler.status();
        assert!(!status.running);
        assert_eq!(status.last_run.unwrap().reset, 1);
    }

    #[tokio::test]
    async fn test_failed_pass_is_recorded() {
        let store = Arc::new(MemoryQuotaStore::with_records([expired_record(1)]));
        store.fail_listing();
        let scheduler =
            scheduler_with(store.clone(), Trigger::Every(Duration::from_secs(86400))).await;

        assert!(scheduler.run_now().await.is_err());
        let status = scheduler.status();
        assert!(!status.running);
        assert!(status.last_run.unwrap().error.is_some());

        // The next pass still runs
        assert!(scheduler.run_now().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_passes_never_overlap() {
        let store = Arc::new(MemoryQuotaStore::with_records([expired_record(1)]));
        store.delay_listing(Duration::from_millis(50));
        let scheduler = Arc::new(
            scheduler_with(store.clone(), Trigger::Every(Duration::from_secs(86400))).await,
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move { scheduler.run_now().await })
            })
            .collect();

        let mut total_reset = 0;
        for handle in handles {
            total_reset += handle.await.unwrap().unwrap().reset;
        }

        assert_eq!(store.max_concurrent_lists(), 1);
        // Only the first pass found the expired record
        assert_eq!(total_reset, 1);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let store = Arc::new(MemoryQuotaStore::new());
        let scheduler = scheduler_with(store, Trigger::Every(Duration::from_secs(86400))).await;

        scheduler.start().await.unwrap();
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyStarted)
        ));
        assert!(scheduler.status().started);
        assert!(scheduler.status().job_id.is_some());

        scheduler.stop().await.unwrap();
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyStarted)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interval_job_fires() {
        let store = Arc::new(MemoryQuotaStore::with_records([expired_record(1)]));
        let scheduler = scheduler_with(store.clone(), Trigger::Every(Duration::from_secs(1))).await;
        scheduler.start().await.unwrap();

        let mut fired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if scheduler.status().last_run.is_some() {
                fired = true;
                break;
            }
        }
        scheduler.stop().await.unwrap();

        assert!(fired, "reset job did not fire");
        assert_eq!(store.snapshot(1).unwrap().remaining, 3);
    }
}
