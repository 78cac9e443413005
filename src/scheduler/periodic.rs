//! Cron-driven enqueue of the `scan-stale` and `reap-locks` jobs.
//!
//! Every worker process runs a periodic enqueuer. Each fire time is claimed
//! with `SET NX` on `{namespace}:periodic:{job}:{timestamp}` so that exactly
//! one process enqueues the job for that slot.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::job::{Job, JobKind};
use super::queue::{JobEnqueuer, QueueError};

/// How long a claimed slot key lives in Redis.
const SLOT_TTL_SECS: u64 = 3600;

/// A job kind enqueued on a cron schedule.
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    /// Job to enqueue.
    pub kind: JobKind,
    /// Six-field cron schedule (with seconds), evaluated in UTC.
    pub schedule: Schedule,
}

impl PeriodicJob {
    /// Parses `cron_spec` for `kind`.
    pub fn new(kind: JobKind, cron_spec: &str) -> Result<Self, cron::error::Error> {
        Ok(Self {
            kind,
            schedule: Schedule::from_str(cron_spec)?,
        })
    }
}

/// Returns the latest fire time in `(after, now]`, if any.
///
/// Fire times missed while the process was stalled collapse into the most
/// recent one; a single scan or reap catches up on all of them.
pub fn latest_due(
    schedule: &Schedule,
    after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after)
        .take_while(|fire| *fire <= now)
        .last()
}

/// Enqueues periodic jobs when their cron slots come due.
pub struct PeriodicEnqueuer {
    redis: ConnectionManager,
    key_prefix: String,
    jobs: Vec<PeriodicJob>,
    enqueuer: Arc<dyn JobEnqueuer>,
    tick: Duration,
    max_attempts: u32,
}

impl PeriodicEnqueuer {
    /// Creates an enqueuer claiming slots under `{namespace}:periodic`.
    pub fn new(
        redis: ConnectionManager,
        namespace: &str,
        jobs: Vec<PeriodicJob>,
        enqueuer: Arc<dyn JobEnqueuer>,
    ) -> Self {
        Self {
            redis,
            key_prefix: format!("{}:periodic", namespace),
            jobs,
            enqueuer,
            tick: Duration::from_secs(1),
            max_attempts: 1,
        }
    }

    /// Sets the max attempts of enqueued jobs.
    ///
    /// Defaults to one: a failed scan or reap is simply redone at the next
    /// slot.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Runs until a shutdown signal arrives.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(jobs = self.jobs.len(), "Periodic enqueuer started");

        let mut last_checked = Utc::now();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    for job in &self.jobs {
                        if let Some(slot) = latest_due(&job.schedule, last_checked, now) {
                            self.fire(job.kind, slot).await;
                        }
                    }
                    last_checked = now;
                }
            }
        }

        info!("Periodic enqueuer stopped");
    }

    async fn fire(&self, kind: JobKind, slot: DateTime<Utc>) {
        match self.claim_slot(kind, slot).await {
            Ok(true) => {
                let job = Job::new(kind).with_max_attempts(self.max_attempts);
                match self.enqueuer.enqueue_now(job).await {
                    Ok(()) => info!(job = %kind, slot = %slot, "Enqueued periodic job"),
                    Err(e) => error!(job = %kind, error = %e, "Failed to enqueue periodic job"),
                }
            }
            Ok(false) => {
                debug!(job = %kind, slot = %slot, "Periodic slot already claimed");
            }
            Err(e) => {
                error!(job = %kind, error = %e, "Failed to claim periodic slot");
            }
        }
    }

    async fn claim_slot(&self, kind: JobKind, slot: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let key = format!("{}:{}:{}", self.key_prefix, kind.name(), slot.timestamp());

        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(SLOT_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }
}
