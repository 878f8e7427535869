use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::models::{ConsumeOutcome, ConsumeRequest, ConsumeResponse, QuotaRecord, QuotaStatus};
use super::service::QuotaError;
use crate::db::SelectionRecord;
use crate::AppState;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    pub candidate_id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResponse {
    #[serde(flatten)]
    pub quota: ConsumeResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRecord>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectionListResponse {
    pub user_id: i64,
    pub selections: Vec<SelectionRecord>,
    pub count: usize,
}

fn decision_status(outcome: &ConsumeOutcome) -> StatusCode {
    if outcome.is_allowed() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    }
}

/// Current quota for a user
///
/// GET /quotas/{user_id}
pub async fn get_quota(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<QuotaStatus>, QuotaError> {
    let status = state.quota_service.status(user_id, Utc::now()).await?;
    Ok(Json(status))
}

/// Consume quota units
///
/// POST /quotas/{user_id}/consume
pub async fn consume_quota(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    body: Option<Json<ConsumeRequest>>,
) -> Result<(StatusCode, Json<ConsumeResponse>), QuotaError> {
    let amount = body.map_or(1, |Json(req)| req.amount);
    let outcome = state
        .quota_service
        .consume(user_id, amount, Utc::now())
        .await?;

    Ok((
        decision_status(&outcome),
        Json(ConsumeResponse::from_outcome(user_id, &outcome)),
    ))
}

/// Administrative repair: reset one user's window if it has elapsed
///
/// POST /quotas/{user_id}/reset
pub async fn reset_quota(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<QuotaRecord>, QuotaError> {
    let record = state.quota_service.reset_one(user_id, Utc::now()).await?;
    Ok(Json(record))
}

/// View the next candidate, spending one selection
///
/// POST /users/{user_id}/selections
pub async fn create_selection(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(request): Json<SelectionRequest>,
) -> Result<(StatusCode, Json<SelectionResponse>), QuotaError> {
    if request.candidate_id == user_id {
        return Err(QuotaError::Validation(
            "users cannot select themselves".to_string(),
        ));
    }

    let now = Utc::now();
    let outcome = state.quota_service.consume(user_id, 1, now).await?;

    let selection = if outcome.is_allowed() {
        match state
            .selections
            .record(user_id, request.candidate_id, now)
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::error!(user_id, candidate_id = request.candidate_id, error = %e, "Failed to record selection, refunding quota");
                if let Err(refund_err) = state.quota_service.refund(user_id, 1, now).await {
                    tracing::error!(user_id, error = %refund_err, "Quota refund failed");
                }
                return Err(e.into());
            }
        }
    } else {
        None
    };

    Ok((
        decision_status(&outcome),
        Json(SelectionResponse {
            quota: ConsumeResponse::from_outcome(user_id, &outcome),
            selection,
        }),
    ))
}

/// Selection history, newest first
///
/// GET /users/{user_id}/selections?limit={n}
pub async fn list_selections(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<SelectionListResponse>, QuotaError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let selections = state.selections.list_for_user(user_id, limit).await?;

    Ok(Json(SelectionListResponse {
        user_id,
        count: selections.len(),
        selections,
    }))
}
