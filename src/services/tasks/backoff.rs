use chrono::{DateTime, Utc};
use std::time::Duration;

use super::types::AnalysisTask;

/// Backoff exponent stops growing here.
pub const BACKOFF_LIMIT: u32 = 10;

/// Earliest moment a failed task may run again.
///
/// The wait is `base * 2^backoff_count`, bounded by `cap`.
pub fn next_retry_at(
    backoff_count: u32,
    last_updated: DateTime<Utc>,
    base: Duration,
    cap: Duration,
) -> DateTime<Utc> {
    let factor = 1u32 << backoff_count.min(BACKOFF_LIMIT);
    let wait = base.saturating_mul(factor).min(cap);
    let wait = chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::days(365));
    last_updated
        .checked_add_signed(wait)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap: cap.max(base),
        }
    }

    pub fn is_exhausted(&self, task: &AnalysisTask) -> bool {
        task.retry_count >= self.max_retries
    }

    pub fn retry_at(&self, task: &AnalysisTask) -> DateTime<Utc> {
        next_retry_at(task.backoff_count, task.last_updated, self.base, self.cap)
    }

    pub fn allows_retry(&self, task: &AnalysisTask, now: DateTime<Utc>) -> bool {
        !self.is_exhausted(task) && now > self.retry_at(task)
    }
}
