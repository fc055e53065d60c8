use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::tracker::{FlushJobState, FlushJobTracker};
use super::{FlushJob, RetryPolicy};
use crate::cache::{CategoryCache, StoreError};

#[derive(Debug, Clone, Error)]
pub enum FlushJobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("flush attempt timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Completed { attempts: u32, evicted: usize },
    FailedPermanently { attempts: u32, error: String },
}

/// Run one flush job to completion, retrying per `policy`.
///
/// Never returns an error: a job that exhausts its attempts is logged and
/// recorded as permanently failed.
#[instrument(
    skip_all,
    fields(job_id = %job.id, mode = %job.scope.mode)
)]
pub async fn process_flush_job(
    cache: &CategoryCache,
    job: &FlushJob,
    policy: &RetryPolicy,
    tracker: &FlushJobTracker,
) -> FlushOutcome {
    let mode = job.scope.mode.as_str();
    let started = Instant::now();
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        tracker.record(job.id, FlushJobState::Running { attempt });
        info!(
            target = "application::jobs::flush",
            job_id = %job.id,
            mode,
            attempt,
            roots = ?job.scope.affected_root_ids,
            "Flush job running"
        );

        match attempt_flush(cache, job, policy.attempt_timeout).await {
            Ok(evicted) => {
                tracker.record(job.id, FlushJobState::Completed { attempts: attempt, evicted });
                counter!("flush_job_total", "status" => "completed", "mode" => mode).increment(1);
                histogram!("flush_job_duration_seconds", "mode" => mode)
                    .record(started.elapsed().as_secs_f64());
                info!(
                    target = "application::jobs::flush",
                    job_id = %job.id,
                    mode,
                    attempt,
                    evicted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flush job completed"
                );
                return FlushOutcome::Completed {
                    attempts: attempt,
                    evicted,
                };
            }
            Err(err) => {
                tracker.record(
                    job.id,
                    FlushJobState::Failed {
                        attempt,
                        error: err.to_string(),
                    },
                );
                counter!("flush_job_total", "status" => "failed", "mode" => mode).increment(1);
                warn!(
                    target = "application::jobs::flush",
                    job_id = %job.id,
                    mode,
                    attempt,
                    error = %err,
                    "Flush attempt failed"
                );
                last_error = Some(err);
            }
        }

        if attempt < policy.max_attempts {
            let backoff = policy.backoff_after(attempt);
            tracker.record(job.id, FlushJobState::Retrying { attempt, backoff });
            counter!("flush_job_total", "status" => "retrying", "mode" => mode).increment(1);
            info!(
                target = "application::jobs::flush",
                job_id = %job.id,
                mode,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Flush job retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    let error = last_error
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no attempts made".to_string());
    tracker.record(
        job.id,
        FlushJobState::FailedPermanently {
            attempts: policy.max_attempts,
            error: error.clone(),
        },
    );
    counter!("flush_job_total", "status" => "failed_permanently", "mode" => mode).increment(1);
    histogram!("flush_job_duration_seconds", "mode" => mode)
        .record(started.elapsed().as_secs_f64());
    error!(
        target = "application::jobs::flush",
        job_id = %job.id,
        event_id = ?job.event_id,
        mode,
        roots = ?job.scope.affected_root_ids,
        nodes = ?job.scope.affected_node_ids,
        attempts = policy.max_attempts,
        error = %error,
        "Flush job failed permanently; stale entries expire by TTL"
    );

    FlushOutcome::FailedPermanently {
        attempts: policy.max_attempts,
        error,
    }
}

async fn attempt_flush(
    cache: &CategoryCache,
    job: &FlushJob,
    timeout: Duration,
) -> Result<usize, FlushJobError> {
    match tokio::time::timeout(timeout, cache.forget_scope(&job.scope)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(FlushJobError::Timeout(timeout)),
    }
}
