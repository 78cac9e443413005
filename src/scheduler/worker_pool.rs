//! Worker pool for processing jobs from the Redis queue.
//!
//! Each worker runs as an independent async task that pulls jobs from the
//! shared queue and hands them to a [`JobHandler`]. One extra task keeps the
//! pool's consumer heartbeat fresh, promotes delayed jobs onto the main list
//! as they fall due, and reclaims jobs of consumers that died.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Per-job timeout
//! - Retry with growing backoff, dead letter queue for exhausted or permanent failures
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::metrics::MetricsCollector;

use super::backoff::retry_backoff;
use super::job::Job;
use super::queue::{JobQueue, LeasedJob, QueueError, HEARTBEAT_TTL};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to connect to the job queue.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Executes the body of a dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs `job`. An error marks the attempt as failed.
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a dequeue blocks, and how often delayed jobs are promoted.
    pub poll_interval: Duration,
    /// Maximum time allowed for processing a single job.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 5,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Counters of what the pool did with the jobs it ran.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers inside a handler right now.
    pub active_workers: usize,
    pub jobs_completed: u64,
    /// Failed attempts put back on the delayed set.
    pub jobs_retried: u64,
    /// Jobs that failed permanently or ran out of attempts.
    pub jobs_dead_lettered: u64,
    /// Attempts cut off by the job timeout (also counted as retried or dead-lettered).
    pub jobs_timed_out: u64,
    /// Mean handler run time over every attempt.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Attempts that ended in any way.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.failed_attempts()
    }

    pub fn failed_attempts(&self) -> u64 {
        self.jobs_retried + self.jobs_dead_lettered
    }

    /// Share of attempts that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        match self.total_processed() {
            0 => 0.0,
            total => self.jobs_completed as f64 * 100.0 / total as f64,
        }
    }
}

#[derive(Default)]
struct SharedPoolStats {
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    timed_out: AtomicU64,
    busy_ms: AtomicU64,
    active: AtomicU64,
}

impl SharedPoolStats {
    fn begin(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self, disposition: Disposition, timed_out: bool, duration: Duration) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.busy_ms
            .fetch_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
        let counter = match disposition {
            Disposition::Complete => &self.completed,
            Disposition::Retry(_) => &self.retried,
            Disposition::DeadLetter => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        let mut stats = PoolStats {
            num_workers,
            active_workers: self.active.load(Ordering::SeqCst) as usize,
            jobs_completed: self.completed.load(Ordering::SeqCst),
            jobs_retried: self.retried.load(Ordering::SeqCst),
            jobs_dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            jobs_timed_out: self.timed_out.load(Ordering::SeqCst),
            average_job_duration: Duration::ZERO,
        };
        let attempts = stats.total_processed();
        if attempts > 0 {
            stats.average_job_duration =
                Duration::from_millis(self.busy_ms.load(Ordering::SeqCst) / attempts);
        }
        stats
    }
}

/// What the worker does with a job after its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Complete,
    Retry(Duration),
    DeadLetter,
}

impl Disposition {
    fn outcome(&self) -> &'static str {
        match self {
            Disposition::Complete => "completed",
            Disposition::Retry(_) => "retried",
            Disposition::DeadLetter => "dead_lettered",
        }
    }
}

/// Decides the fate of `job` given its handler result.
///
/// Failures bump the attempt counter on `job`.
fn dispose(job: &mut Job, result: &Result<(), JobError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Complete,
        Err(e) if e.is_permanent() => {
            job.record_failure(e.to_string());
            Disposition::DeadLetter
        }
        Err(e) => {
            job.record_failure(e.to_string());
            if job.should_retry() {
                Disposition::Retry(retry_backoff(job.attempts))
            } else {
                Disposition::DeadLetter
            }
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over an existing queue.
    pub fn new(config: WorkerPoolConfig, queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Registers the pool's consumer heartbeat first, then reclaims jobs left
    /// by consumers whose heartbeat expired.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running, or
    /// `PoolError::QueueConnection` if the heartbeat cannot be written.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        self.queue.heartbeat().await?;
        recover_expired(&self.queue).await;

        let promoter = Promoter {
            queue: Arc::clone(&self.queue),
            shutdown_rx: self.shutdown_tx.subscribe(),
            interval: self.config.poll_interval,
            metrics: self.metrics.clone(),
        };
        self.worker_handles.push(tokio::spawn(promoter.run()));

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                job_timeout: self.config.job_timeout,
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.set_active_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop dequeuing and finish their current job. Jobs still
    /// running at the timeout are abandoned: the heartbeat is dropped so
    /// another process reclaims them, and their account locks are left for
    /// the reaper.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        if let Err(e) = self.queue.retire().await {
            warn!(error = %e, "Failed to drop consumer heartbeat");
        }
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.set_active_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

async fn recover_expired(queue: &JobQueue) {
    match queue.recover_processing_jobs().await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered = recovered, "Recovered jobs of expired consumers"),
        Err(e) => warn!(error = %e, "Failed to recover processing jobs"),
    }
}

/// Heartbeat, delayed-job promotion and queue gauges on every tick;
/// reclaiming of dead consumers once per heartbeat TTL.
struct Promoter {
    queue: Arc<JobQueue>,
    shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
    metrics: MetricsCollector,
}

impl Promoter {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reclaim = tokio::time::interval(HEARTBEAT_TTL);
        reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // start() already reclaimed once.
        reclaim.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = reclaim.tick() => recover_expired(&self.queue).await,
                _ = ticker.tick() => promoter_tick(&self.queue, &self.metrics).await,
            }
        }

        debug!("Delayed job promoter stopped");
    }
}

async fn promoter_tick(queue: &JobQueue, metrics: &MetricsCollector) {
    if let Err(e) = queue.heartbeat().await {
        warn!(error = %e, "Failed to refresh consumer heartbeat");
    }
    match queue.promote_due().await {
        Ok(0) => {}
        Ok(promoted) => debug!(promoted = promoted, "Promoted delayed jobs"),
        Err(e) => warn!(error = %e, "Failed to promote delayed jobs"),
    }
    match queue.stats().await {
        Ok(stats) => metrics.set_queue_depth(&stats),
        Err(e) => debug!(error = %e, "Failed to read queue depth"),
    }
}

/// A single worker that processes jobs from the queue.
struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Interval between poll attempts when queue is empty.
    poll_interval: Duration,
    /// Maximum time for processing a single job.
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Continuously polls for jobs and processes them until a shutdown
    /// signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(leased)) => {
                    self.process_job(leased).await;
                }
                Ok(None) => {
                    // The dequeue already waited poll_interval
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single job.
    async fn process_job(&self, leased: LeasedJob) {
        let mut job = leased.job.clone();
        let job_id = job.id;
        let start_time = Instant::now();

        debug!(
            worker_id = %self.id,
            job_id = %job_id,
            job = %job.kind,
            attempt = job.attempts + 1,
            queued_ms = job.age().num_milliseconds(),
            "Processing job"
        );

        self.stats.begin();
        self.metrics.job_started();

        let (result, timed_out) =
            match tokio::time::timeout(self.job_timeout, self.handler.handle(&job)).await {
                Ok(result) => (result, false),
                Err(_) => (Err(JobError::Timeout(self.job_timeout)), true),
            };
        let duration = start_time.elapsed();
        self.metrics.job_finished();

        let disposition = dispose(&mut job, &result);
        self.stats.end(disposition, timed_out, duration);
        self.metrics
            .record_job(job.name(), disposition.outcome(), duration.as_secs_f64());

        let queue_result = match disposition {
            Disposition::Complete => {
                debug!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis(),
                    "Job completed"
                );
                self.queue.complete(&leased).await
            }
            Disposition::Retry(delay) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    job = %job.kind,
                    error = ?job.last_error,
                    remaining_attempts = job.remaining_attempts(),
                    delay_secs = delay.as_secs(),
                    "Job failed, scheduling retry"
                );
                self.queue.retry_after(&leased, &job, delay).await
            }
            Disposition::DeadLetter => {
                let error = job.last_error.clone().unwrap_or_default();
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    job = %job.kind,
                    error = %error,
                    attempts = job.attempts,
                    "Job dead-lettered"
                );
                self.queue.dead_letter(&leased, &job, &error).await
            }
        };

        if let Err(e) = queue_result {
            error!(
                worker_id = %self.id,
                job_id = %job_id,
                error = %e,
                "Failed to update queue after job"
            );
        }
    }
}
