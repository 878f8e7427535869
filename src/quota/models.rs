use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Per-user selection budget for the current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub user_id: i64,
    /// Selections left in the current window
    pub remaining: u32,
    /// Maximum selections per window
    pub capacity: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub last_reset_at: DateTime<Utc>,
    /// Optimistic concurrency token
    #[serde(skip)]
    pub version: i64,
}

impl QuotaRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }
}

/// Where a record sits in its cycle at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QuotaState {
    Fresh,
    Exhausted,
    /// Window elapsed; the next touch replenishes it
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    InsufficientQuota,
}

/// Policy verdict for a consumption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied(DenyReason),
}

/// Result of `QuotaService::consume`.
///
/// A denial is a normal business outcome; system failures travel as `QuotaError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Allowed { remaining: u32 },
    Denied { reason: DenyReason, record: QuotaRecord },
}

impl ConsumeOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Read-only view of a user's quota
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub user_id: i64,
    pub state: QuotaState,
    pub remaining: u32,
    pub capacity: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub last_reset_at: DateTime<Utc>,
}

/// Request body for `POST /quotas/{user_id}/consume`
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsumeRequest {
    #[serde(default = "default_amount")]
    pub amount: u32,
}

fn default_amount() -> u32 {
    1
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub user_id: i64,
    pub allowed: bool,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_end: Option<DateTime<Utc>>,
}

impl ConsumeResponse {
    pub fn from_outcome(user_id: i64, outcome: &ConsumeOutcome) -> Self {
        match outcome {
            ConsumeOutcome::Allowed { remaining } => Self {
                user_id,
                allowed: true,
                remaining: *remaining,
                reason: None,
                window_end: None,
            },
            ConsumeOutcome::Denied { reason, record } => Self {
                user_id,
                allowed: false,
                remaining: record.remaining,
                reason: Some(*reason),
                window_end: Some(record.window_end),
            },
        }
    }
}
