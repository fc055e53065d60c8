//! Debounced flush scheduling.
//!
//! Each scope is split into per-shard units. The first unit to arrive in a
//! window claims `<namespace>debounce:<mode>:<digest>` with `create_if_absent`
//! and enqueues one flush delayed by the window; later identical units find
//! the marker and collapse into that flush.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::scope::InvalidationScope;
use super::store::SharedStore;
use crate::application::jobs::{FlushJob, JobId, JobRunner};

/// What happened to each unit of a scheduled scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub scheduled: Vec<JobId>,
    pub collapsed: usize,
    /// Units enqueued without a debounce marker because the store failed.
    pub fail_open: usize,
    /// Units the job runner refused.
    pub rejected: usize,
}

impl ScheduleReport {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.collapsed == 0 && self.rejected == 0
    }

    fn absorb(&mut self, other: ScheduleReport) {
        self.scheduled.extend(other.scheduled);
        self.collapsed += other.collapsed;
        self.fail_open += other.fail_open;
        self.rejected += other.rejected;
    }
}

pub struct DebounceScheduler {
    store: Arc<dyn SharedStore>,
    runner: Arc<dyn JobRunner>,
    namespace: String,
    window: Duration,
}

impl DebounceScheduler {
    pub fn new(
        store: Arc<dyn SharedStore>,
        runner: Arc<dyn JobRunner>,
        namespace: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            namespace: namespace.into(),
            window,
        }
    }

    pub async fn schedule(&self, scope: &InvalidationScope, event_id: Option<Uuid>) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        for unit in scope.units() {
            report.absorb(self.schedule_unit(unit, event_id).await);
        }
        report
    }

    async fn schedule_unit(&self, unit: InvalidationScope, event_id: Option<Uuid>) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        let key = unit.debounce_key(&self.namespace);

        let fail_open = match self.store.create_if_absent(&key, self.window).await {
            Ok(true) => false,
            Ok(false) => {
                counter!("flush_debounce_total", "outcome" => "collapsed").increment(1);
                debug!(
                    target = "cache::debounce",
                    key = %key,
                    mode = %unit.mode,
                    "Flush already pending; collapsed"
                );
                report.collapsed += 1;
                return report;
            }
            Err(err) => {
                warn!(
                    target = "cache::debounce",
                    key = %key,
                    mode = %unit.mode,
                    error = %err,
                    "Debounce store unavailable; scheduling flush without marker"
                );
                true
            }
        };

        let mode = unit.mode;
        let job = FlushJob::new(unit, event_id);
        match self.runner.enqueue(job, self.window) {
            Ok(job_id) => {
                let outcome = if fail_open { "fail_open" } else { "scheduled" };
                counter!("flush_debounce_total", "outcome" => outcome).increment(1);
                info!(
                    target = "cache::debounce",
                    job_id = %job_id,
                    key = %key,
                    mode = %mode,
                    outcome,
                    "Flush scheduled"
                );
                report.scheduled.push(job_id);
                if fail_open {
                    report.fail_open += 1;
                }
            }
            Err(err) => {
                counter!("flush_debounce_total", "outcome" => "rejected").increment(1);
                warn!(
                    target = "cache::debounce",
                    key = %key,
                    mode = %mode,
                    error = %err,
                    "Flush job rejected; releasing debounce marker"
                );
                if !fail_open && let Err(err) = self.store.delete(&key).await {
                    warn!(target = "cache::debounce", key = %key, error = %err, "Marker release failed");
                }
                report.rejected += 1;
            }
        }
        report
    }
}
