use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;

use super::JobId;
use crate::cache::lock::mutex_lock;

/// Finished jobs kept for inspection before the oldest are forgotten.
pub const DEFAULT_FINISHED_RETENTION: usize = 1024;

/// Lifecycle of a flush job.
///
/// `Queued -> Running -> Completed`, or `Running -> Failed -> Retrying ->
/// Running`, ending in `FailedPermanently` once attempts run out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushJobState {
    Queued,
    Running { attempt: u32 },
    Completed { attempts: u32, evicted: usize },
    Failed { attempt: u32, error: String },
    Retrying { attempt: u32, backoff: Duration },
    FailedPermanently { attempts: u32, error: String },
}

impl FlushJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushJobState::Queued => "queued",
            FlushJobState::Running { .. } => "running",
            FlushJobState::Completed { .. } => "completed",
            FlushJobState::Failed { .. } => "failed",
            FlushJobState::Retrying { .. } => "retrying",
            FlushJobState::FailedPermanently { .. } => "failed_permanently",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlushJobState::Completed { .. } | FlushJobState::FailedPermanently { .. }
        )
    }
}

/// State history of in-flight jobs and of the most recently finished ones.
///
/// Jobs stay tracked while they are queued or running; once terminal they
/// are kept until `retention` newer jobs have finished.
#[derive(Debug)]
pub struct FlushJobTracker {
    jobs: DashMap<JobId, Vec<FlushJobState>>,
    finished: Mutex<VecDeque<JobId>>,
    retention: usize,
}

impl Default for FlushJobTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }
}

impl FlushJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn record(&self, id: JobId, state: FlushJobState) {
        let terminal = state.is_terminal();
        self.jobs.entry(id).or_default().push(state);
        if !terminal {
            return;
        }

        let mut finished = mutex_lock(&self.finished, "application::jobs::tracker", "record");
        finished.push_back(id);
        while finished.len() > self.retention {
            if let Some(oldest) = finished.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    pub fn state(&self, id: JobId) -> Option<FlushJobState> {
        self.jobs.get(&id).and_then(|history| history.last().cloned())
    }

    pub fn history(&self, id: JobId) -> Vec<FlushJobState> {
        self.jobs
            .get(&id)
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of jobs per current state label.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.jobs.iter() {
            if let Some(state) = entry.value().last() {
                *counts.entry(state.as_str()).or_default() += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
