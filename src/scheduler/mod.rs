pub mod handlers;
mod jobs;
mod service;

pub use jobs::{RunSummary, Trigger};
pub use service::{QuotaScheduler, SchedulerStatus};
