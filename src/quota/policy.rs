use chrono::{DateTime, Duration, Utc};

use super::models::{Decision, DenyReason, QuotaRecord, QuotaState};

/// Window arithmetic for quota records. Implementations must be pure.
pub trait QuotaPolicy: Send + Sync {
    /// Default per-window allowance for newly created records
    fn capacity(&self) -> u32;

    fn interval(&self) -> Duration;

    /// Fresh record for a user that has none yet
    fn new_record(&self, user_id: i64, now: DateTime<Utc>) -> QuotaRecord {
        let capacity = self.capacity();
        QuotaRecord {
            user_id,
            remaining: capacity,
            capacity,
            window_start: now,
            window_end: window_end(now, self.interval()),
            last_reset_at: now,
            version: 0,
        }
    }

    /// Replenish the record if its window has elapsed, otherwise return it unchanged.
    fn compute_reset(&self, record: &QuotaRecord, now: DateTime<Utc>) -> QuotaRecord {
        if !record.is_expired(now) {
            return record.clone();
        }
        QuotaRecord {
            remaining: record.capacity,
            window_start: now,
            window_end: window_end(now, self.interval()),
            last_reset_at: now,
            ..record.clone()
        }
    }

    /// Apply an implicit reset, then draw `amount` units if available.
    fn try_consume(
        &self,
        record: &QuotaRecord,
        now: DateTime<Utc>,
        amount: u32,
    ) -> (QuotaRecord, Decision) {
        let mut next = self.compute_reset(record, now);
        if amount > 0 && next.remaining >= amount {
            next.remaining -= amount;
            let remaining = next.remaining;
            (next, Decision::Allowed { remaining })
        } else {
            (next, Decision::Denied(DenyReason::InsufficientQuota))
        }
    }

    fn state(&self, record: &QuotaRecord, now: DateTime<Utc>) -> QuotaState {
        if record.is_expired(now) {
            QuotaState::Expired
        } else if record.remaining == 0 {
            QuotaState::Exhausted
        } else {
            QuotaState::Fresh
        }
    }
}

/// End of a window opened at `now`, pinned to the last representable instant
fn window_end(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    now.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Fixed-length windows with a single configured capacity
#[derive(Debug, Clone)]
pub struct FixedWindowPolicy {
    capacity: u32,
    interval: Duration,
}

impl FixedWindowPolicy {
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self { capacity, interval }
    }
}

impl QuotaPolicy for FixedWindowPolicy {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
