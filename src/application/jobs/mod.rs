//! Background cache flush jobs.

mod flush;
mod runner;
mod tracker;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{CacheConfig, InvalidationScope};

pub use flush::{FlushJobError, FlushOutcome, process_flush_job};
pub use runner::TokioJobRunner;
pub use tracker::{FlushJobState, FlushJobTracker};

pub type JobId = Uuid;

/// Eviction of one debounced scope unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushJob {
    pub id: JobId,
    pub scope: InvalidationScope,
    /// Mutation event that armed the debounce window.
    pub event_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl FlushJob {
    pub fn new(scope: InvalidationScope, event_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            event_id,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before retry `n` is `backoff[n - 1]`; the last value repeats.
    pub backoff: Vec<Duration>,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for RetryPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_attempts: config.flush_max_attempts.max(1),
            backoff: config.flush_backoff(),
            attempt_timeout: config.flush_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no async runtime available to run flush job")]
    RuntimeUnavailable,
    #[error("job runner rejected flush job: {0}")]
    Rejected(String),
}

/// Accepts flush jobs and runs them later, off the caller's path.
pub trait JobRunner: Send + Sync {
    /// Schedule `job` to start after `delay`. Never waits for the job.
    fn enqueue(&self, job: FlushJob, delay: Duration) -> Result<JobId, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_schedule_and_repeats_last() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_after(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(15));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(30));
        assert_eq!(policy.backoff_after(9), Duration::from_secs(30));
    }

    #[test]
    fn empty_backoff_means_immediate_retry() {
        let policy = RetryPolicy {
            backoff: Vec::new(),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_after(1), Duration::ZERO);
    }
}
