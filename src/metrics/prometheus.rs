//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by replay_watch and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all replay_watch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of jobs processed, labeled by job name and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution duration in seconds, labeled by job name.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs in queue, labeled by queue (pending/processing/scheduled/dead_letter).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Poll executions, labeled by outcome (changed/unchanged/throttled/error).
pub static POLLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Notification deliveries, labeled by status (delivered/failed).
pub static NOTIFICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Account locks taken by the scanner.
pub static LOCKS_ACQUIRED: OnceLock<Counter> = OnceLock::new();

/// Account locks released by the reaper.
pub static LOCKS_REAPED: OnceLock<Counter> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("replay_watch_jobs_total", "Total number of jobs processed"),
        &["job", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "replay_watch_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["job"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("replay_watch_queue_depth", "Number of jobs in queue"),
        &["queue"],
    )?;

    let jobs_in_progress = Gauge::new(
        "replay_watch_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Scheduling metrics
    let polls_total = CounterVec::new(
        Opts::new("replay_watch_polls_total", "Poll executions by outcome"),
        &["outcome"],
    )?;

    let notifications_total = CounterVec::new(
        Opts::new(
            "replay_watch_notifications_total",
            "Notification deliveries by status",
        ),
        &["status"],
    )?;

    let locks_acquired = Counter::new(
        "replay_watch_locks_acquired_total",
        "Account locks taken by the scanner",
    )?;

    let locks_reaped = Counter::new(
        "replay_watch_locks_reaped_total",
        "Account locks released by the reaper",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("replay_watch_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(polls_total.clone()))?;
    registry.register(Box::new(notifications_total.clone()))?;
    registry.register(Box::new(locks_acquired.clone()))?;
    registry.register(Box::new(locks_reaped.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = POLLS_TOTAL.set(polls_total);
    let _ = NOTIFICATIONS_TOTAL.set(notifications_total);
    let _ = LOCKS_ACQUIRED.set(locks_acquired);
    let _ = LOCKS_REAPED.set(locks_reaped);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(polls) = POLLS_TOTAL.get() {
            polls.with_label_values(&["unchanged"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("replay_watch_polls_total"));
    }
}
