//! Job bodies: staleness scan, lock reaping, account polling and fan-out.
//!
//! Every body works against the collaborator traits held by a
//! [`JobContext`], so the same code runs over Postgres/Redis in the worker
//! and over in-memory fakes in tests.

pub mod fanout;
pub mod poll;
pub mod reaper;
pub mod scanner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::error::JobError;
use crate::metrics::MetricsCollector;
use crate::notify::Messenger;
use crate::ratelimit::RateLimiter;
use crate::replays::StatsApi;
use crate::scheduler::{BackoffWindow, Job, JobEnqueuer, JobHandler, JobKind};
use crate::storage::AccountStore;

pub use fanout::notify_subscribers;
pub use poll::{poll_account, LockLease, PollOutcome};
pub use reaper::reap_locks;
pub use scanner::{scan_stale, ScanReport};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Tunables of the scheduling policy.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingSettings {
    /// Minimum time between two checks of an account.
    pub update_interval: Duration,
    /// Age after which a lock is considered abandoned.
    pub lock_ttl: Duration,
    /// Delay window for throttled polls.
    pub backoff: BackoffWindow,
    /// Attempts given to each enqueued poll job.
    pub max_attempts: u32,
}

impl SchedulingSettings {
    /// Extracts the scheduling settings from a validated config.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            update_interval: config.update_interval,
            lock_ttl: config.lock_ttl,
            backoff: config.throttle_backoff()?,
            max_attempts: config.max_attempts,
        })
    }
}

/// Collaborators shared by every job body.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn AccountStore>,
    pub limiter: Arc<dyn RateLimiter>,
    pub api: Arc<dyn StatsApi>,
    pub messenger: Arc<dyn Messenger>,
    pub enqueuer: Arc<dyn JobEnqueuer>,
    pub clock: Arc<dyn Clock>,
    pub settings: SchedulingSettings,
    pub metrics: MetricsCollector,
}

impl JobContext {
    /// Creates a context using the wall clock.
    pub fn new(
        store: Arc<dyn AccountStore>,
        limiter: Arc<dyn RateLimiter>,
        api: Arc<dyn StatsApi>,
        messenger: Arc<dyn Messenger>,
        enqueuer: Arc<dyn JobEnqueuer>,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            store,
            limiter,
            api,
            messenger,
            enqueuer,
            clock: Arc::new(SystemClock),
            settings,
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A `poll-account` job carrying the configured attempt budget.
    pub(crate) fn poll_job(&self, account_id: i64) -> Job {
        Job::poll_account(account_id).with_max_attempts(self.settings.max_attempts)
    }
}

/// `now - interval`, failing for intervals chrono cannot represent.
pub(crate) fn cutoff(now: DateTime<Utc>, interval: Duration) -> Result<DateTime<Utc>, JobError> {
    let interval = chrono::Duration::from_std(interval)
        .map_err(|e| JobError::InvalidInterval(format!("{:?}: {}", interval, e)))?;
    now.checked_sub_signed(interval)
        .ok_or_else(|| JobError::InvalidInterval(format!("{} minus {}", now, interval)))
}

/// Dispatches dequeued jobs to their bodies.
#[derive(Clone)]
pub struct JobRunner {
    ctx: JobContext,
}

impl JobRunner {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match job.kind {
            JobKind::ScanStale => {
                scan_stale(&self.ctx).await?;
            }
            JobKind::ReapLocks => {
                reap_locks(&self.ctx).await?;
            }
            JobKind::PollAccount { account_id } => {
                let outcome = poll_account(&self.ctx, account_id).await?;
                debug!(account_id = account_id, outcome = ?outcome, "Poll finished");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let before = cutoff(now, Duration::from_secs(300)).unwrap();
        assert_eq!(before, Utc.with_ymd_and_hms(2024, 3, 1, 11, 55, 0).unwrap());
    }

    #[test]
    fn test_cutoff_rejects_huge_interval() {
        let now = Utc::now();
        let err = cutoff(now, Duration::from_secs(u64::MAX)).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::new()
            .with_update_interval(Duration::from_secs(120))
            .with_backoff(Duration::from_secs(5), Duration::from_secs(60));
        let settings = SchedulingSettings::from_config(&config).unwrap();

        assert_eq!(settings.update_interval, Duration::from_secs(120));
        assert_eq!(settings.backoff.low(), Duration::from_secs(5));
        assert_eq!(settings.max_attempts, config.max_attempts);
    }
}
