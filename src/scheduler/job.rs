//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `JobKind`: which job body runs, addressed by a stable name
//! - `Job`: a queued unit of work with its retry bookkeeping

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts for a job.
const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Stable name of the poll job.
pub const POLL_ACCOUNT: &str = "poll-account";
/// Stable name of the staleness scan job.
pub const SCAN_STALE: &str = "scan-stale";
/// Stable name of the lock reaper job.
pub const REAP_LOCKS: &str = "reap-locks";

/// The work a job performs.
///
/// Serialized as `{"name": "...", "args": {...}}`. The names are an external
/// surface: periodic producers and admin tooling enqueue by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "kebab-case")]
pub enum JobKind {
    /// Poll the stats API for one tracked account.
    PollAccount {
        /// Account to poll.
        account_id: i64,
    },
    /// Find stale accounts, lock them and enqueue polls.
    ScanStale,
    /// Release locks held past their TTL.
    ReapLocks,
}

impl JobKind {
    /// Returns the stable job name.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::PollAccount { .. } => POLL_ACCOUNT,
            JobKind::ScanStale => SCAN_STALE,
            JobKind::ReapLocks => REAP_LOCKS,
        }
    }

    /// Builds a job kind from its stable name and arguments.
    pub fn from_name(name: &str, account_id: Option<i64>) -> Result<Self, String> {
        match (name, account_id) {
            (POLL_ACCOUNT, Some(account_id)) => Ok(JobKind::PollAccount { account_id }),
            (POLL_ACCOUNT, None) => Err(format!("{} requires an account id", POLL_ACCOUNT)),
            (SCAN_STALE, None) => Ok(JobKind::ScanStale),
            (REAP_LOCKS, None) => Ok(JobKind::ReapLocks),
            (SCAN_STALE | REAP_LOCKS, Some(_)) => Err(format!("{} takes no arguments", name)),
            (other, _) => Err(format!(
                "unknown job '{}', expected one of {}, {}, {}",
                other, POLL_ACCOUNT, SCAN_STALE, REAP_LOCKS
            )),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::PollAccount { account_id } => write!(f, "{}({})", POLL_ACCOUNT, account_id),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A job representing a unit of work to be executed.
///
/// Jobs are stored in Redis and processed by workers. Results are not kept;
/// a job either completes, is retried, or lands in the dead letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// The work to perform.
    pub kind: JobKind,
    /// When this job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub attempts: u32,
    /// Maximum number of attempts before moving to dead letter queue.
    pub max_attempts: u32,
    /// Error of the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// Creates a new job with default settings.
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            enqueued_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
        }
    }

    /// Creates a `poll-account` job.
    pub fn poll_account(account_id: i64) -> Self {
        Self::new(JobKind::PollAccount { account_id })
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the stable job name.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }

    /// Returns whether the job should be retried after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns how long ago the job was first enqueued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}
