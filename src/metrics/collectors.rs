//! Recording helpers for replay_watch metrics.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics so call
//! sites never deal with uninitialized registries or label order.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, LOCKS_ACQUIRED, LOCKS_REAPED,
    NOTIFICATIONS_TOTAL, POLLS_TOTAL, QUEUE_DEPTH,
};
use crate::scheduler::QueueStats;

/// Metrics collector for recording operational metrics.
///
/// Recording is a no-op until `init_metrics()` has run, so library code and
/// tests can record freely.
///
/// # Example
///
/// ```ignore
/// use replay_watch::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job("poll-account", "completed", 0.42);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a processed job.
    ///
    /// # Arguments
    ///
    /// * `job` - Stable job name
    /// * `outcome` - "completed", "retried" or "dead_lettered"
    /// * `duration_secs` - Execution duration in seconds
    pub fn record_job(&self, job: &str, outcome: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[job, outcome]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration.with_label_values(&[job]).observe(duration_secs);
        }

        tracing::trace!(
            job = job,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record the outcome of one poll execution.
    pub fn record_poll(&self, outcome: &str) {
        if let Some(polls) = POLLS_TOTAL.get() {
            polls.with_label_values(&[outcome]).inc();
        }
    }

    /// Record one notification delivery attempt.
    pub fn record_notification(&self, delivered: bool) {
        let status = if delivered { "delivered" } else { "failed" };
        if let Some(notifications) = NOTIFICATIONS_TOTAL.get() {
            notifications.with_label_values(&[status]).inc();
        }
    }

    /// Record locks taken by a scan.
    pub fn record_locks_acquired(&self, count: u64) {
        if let Some(counter) = LOCKS_ACQUIRED.get() {
            counter.inc_by(count as f64);
        }
    }

    /// Record locks released by the reaper.
    pub fn record_locks_reaped(&self, count: u64) {
        if let Some(counter) = LOCKS_REAPED.get() {
            counter.inc_by(count as f64);
        }
    }

    /// Update queue depth gauges from a stats snapshot.
    pub fn set_queue_depth(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&["pending"])
                .set(stats.pending_jobs as f64);
            queue_depth
                .with_label_values(&["processing"])
                .set(stats.processing_jobs as f64);
            queue_depth
                .with_label_values(&["scheduled"])
                .set(stats.scheduled_jobs as f64);
            queue_depth
                .with_label_values(&["dead_letter"])
                .set(stats.dead_letter_jobs as f64);
        }
    }

    /// Mark a job as started.
    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Mark a job as finished.
    pub fn job_finished(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    /// Set the number of running workers.
    pub fn set_active_workers(&self, count: usize) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(count as f64);
        }
    }
}
