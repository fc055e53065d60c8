use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::flush::process_flush_job;
use super::tracker::{FlushJobState, FlushJobTracker};
use super::{FlushJob, JobError, JobId, JobRunner, RetryPolicy};
use crate::cache::CategoryCache;
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::jobs::runner";

/// Runs flush jobs as tokio tasks, at most `worker_concurrency` at a time.
pub struct TokioJobRunner {
    cache: Arc<CategoryCache>,
    policy: RetryPolicy,
    tracker: Arc<FlushJobTracker>,
    permits: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioJobRunner {
    pub fn new(cache: Arc<CategoryCache>) -> Self {
        let policy = RetryPolicy::from(cache.config());
        let permits = Arc::new(Semaphore::new(cache.config().worker_concurrency()));
        Self {
            cache,
            policy,
            tracker: Arc::new(FlushJobTracker::new()),
            permits,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<FlushJobTracker> {
        &self.tracker
    }

    /// Wait until every job enqueued so far has finished.
    pub async fn wait_idle(&self) {
        loop {
            let pending = std::mem::take(&mut *mutex_lock(&self.tasks, SOURCE, "wait_idle"));
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(err) = task.await {
                    warn!(target = SOURCE, error = %err, "Flush task aborted");
                }
            }
        }
    }
}

impl JobRunner for TokioJobRunner {
    fn enqueue(&self, job: FlushJob, delay: Duration) -> Result<JobId, JobError> {
        let handle = Handle::try_current().map_err(|_| JobError::RuntimeUnavailable)?;
        let id = job.id;

        self.tracker.record(id, FlushJobState::Queued);
        info!(
            target = SOURCE,
            job_id = %id,
            mode = %job.scope.mode,
            delay_ms = delay.as_millis() as u64,
            "Flush job queued"
        );

        let cache = Arc::clone(&self.cache);
        let tracker = Arc::clone(&self.tracker);
        let permits = Arc::clone(&self.permits);
        let policy = self.policy.clone();

        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(target = SOURCE, job_id = %job.id, "Worker pool closed; flush job dropped");
                return;
            };
            process_flush_job(&cache, &job, &policy, &tracker).await;
        });

        let mut tasks = mutex_lock(&self.tasks, SOURCE, "enqueue");
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, InvalidationScope, MemoryStore};

    fn runner() -> TokioJobRunner {
        let config = CacheConfig::default();
        let store = Arc::new(MemoryStore::new(&config));
        TokioJobRunner::new(Arc::new(CategoryCache::new(config, store)))
    }

    #[tokio::test(start_paused = true)]
    async fn job_waits_for_delay_then_completes() {
        let runner = runner();
        let job = FlushJob::new(InvalidationScope::full([]), None);

        let id = runner
            .enqueue(job, Duration::from_secs(2))
            .expect("enqueue");
        assert_eq!(runner.tracker().state(id), Some(FlushJobState::Queued));

        runner.wait_idle().await;
        assert!(matches!(
            runner.tracker().state(id),
            Some(FlushJobState::Completed { attempts: 1, .. })
        ));
    }

    #[test]
    fn enqueue_outside_runtime_is_rejected() {
        let runner = runner();
        let job = FlushJob::new(InvalidationScope::full([]), None);

        assert!(matches!(
            runner.enqueue(job, Duration::ZERO),
            Err(JobError::RuntimeUnavailable)
        ));
    }
}
