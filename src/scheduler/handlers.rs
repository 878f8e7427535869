use axum::{extract::State, Json};

use super::jobs::RunSummary;
use super::service::SchedulerStatus;
use crate::quota::QuotaError;
use crate::AppState;

/// Get scheduler status
/// GET /scheduler/status
pub async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

/// Run a provisioning and reset pass now
/// POST /scheduler/run
pub async fn run_reset_pass(
    State(state): State<AppState>,
) -> Result<Json<RunSummary>, QuotaError> {
    let summary = state.scheduler.run_now().await?;
    Ok(Json(summary))
}
