//! Account poll executor (`poll-account`).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::scheduler::POLL_ACCOUNT;
use crate::storage::{AccountStore, TrackedAccount};

use super::fanout::notify_subscribers;
use super::{Clock, JobContext};

/// How a poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Throttled and re-enqueued; the lock is untouched.
    Deferred { delay: Duration },
    /// The latest replay is the one already recorded.
    Unchanged { marker: i64 },
    /// A new replay was recorded and announced.
    Changed {
        previous: Option<i64>,
        marker: i64,
        notified: usize,
    },
}

impl PollOutcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::Deferred { .. } => "throttled",
            PollOutcome::Unchanged { .. } => "unchanged",
            PollOutcome::Changed { .. } => "changed",
        }
    }
}

/// The scanner's lock on one account, held by an admitted poll.
///
/// [`LockLease::release`] clears the lock and stamps the check time. A lease
/// dropped without release (a timed-out or cancelled poll) still schedules
/// the release on the current runtime; without a runtime the lock is left
/// for the reaper.
pub struct LockLease {
    store: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    account_id: i64,
    released: bool,
}

impl LockLease {
    pub fn new(store: Arc<dyn AccountStore>, clock: Arc<dyn Clock>, account_id: i64) -> Self {
        Self {
            store,
            clock,
            account_id,
            released: false,
        }
    }

    /// Clears the lock and records the check time.
    ///
    /// The lease only counts as released once the store call has returned,
    /// so a poll cancelled mid-release still falls back to the background
    /// release in `Drop`.
    pub async fn release(mut self) -> Result<(), JobError> {
        let now = self.clock.now();
        let result = self.store.release_lock(self.account_id, now).await;
        self.released = true;
        result.map_err(|source| JobError::LockRelease {
            account_id: self.account_id,
            source,
        })
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let account_id = self.account_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(account_id = account_id, "Poll abandoned, releasing lock in background");
                let store = Arc::clone(&self.store);
                let now = self.clock.now();
                handle.spawn(async move {
                    if let Err(e) = store.release_lock(account_id, now).await {
                        error!(account_id = account_id, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(account_id = account_id, "Poll abandoned outside a runtime, lock left for the reaper");
            }
        }
    }
}

/// Runs one poll of `account_id`.
///
/// Order of work: load the account, ask the limiter for one unit, then
/// under the lease fetch the latest replay and compare markers. On a change
/// the marker is written before any notification goes out. The lease is
/// released on every path past admission.
pub async fn poll_account(ctx: &JobContext, account_id: i64) -> Result<PollOutcome, JobError> {
    let result = run_poll(ctx, account_id).await;
    match &result {
        Ok(outcome) => ctx.metrics.record_poll(outcome.label()),
        Err(_) => ctx.metrics.record_poll("error"),
    }
    result
}

async fn run_poll(ctx: &JobContext, account_id: i64) -> Result<PollOutcome, JobError> {
    let account = ctx
        .store
        .get_account(account_id)
        .await?
        .ok_or(JobError::AccountNotFound(account_id))?;

    let admission = ctx.limiter.rate_limit(POLL_ACCOUNT, 1).await?;
    if admission.limited {
        let delay = ctx.settings.backoff.sample();
        ctx.enqueuer
            .enqueue_after(ctx.poll_job(account_id), delay)
            .await?;
        info!(
            account_id = account_id,
            delay_secs = delay.as_secs(),
            "Poll throttled, re-enqueued"
        );
        return Ok(PollOutcome::Deferred { delay });
    }

    let lease = LockLease::new(Arc::clone(&ctx.store), Arc::clone(&ctx.clock), account_id);
    let checked = check_latest_replay(ctx, &account).await;
    let released = lease.release().await;

    match (checked, released) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(release_err)) => {
            error!(account_id = account_id, error = %release_err, "Failed to release account lock");
            Err(release_err)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            error!(account_id = account_id, error = %release_err, "Failed to release account lock");
            Err(e)
        }
    }
}

async fn check_latest_replay(
    ctx: &JobContext,
    account: &TrackedAccount,
) -> Result<PollOutcome, JobError> {
    let replay = ctx.api.latest_replay(&account.api_key).await?;

    if !account.marker_changed(replay.replay_id) {
        debug!(account_id = account.id, marker = replay.replay_id, "No new replay");
        return Ok(PollOutcome::Unchanged {
            marker: replay.replay_id,
        });
    }

    ctx.store.update_marker(account.id, replay.replay_id).await?;
    info!(
        account_id = account.id,
        previous = ?account.last_seen_marker,
        marker = replay.replay_id,
        "New replay recorded"
    );

    let notified = notify_subscribers(ctx, account.id, &replay).await?;

    Ok(PollOutcome::Changed {
        previous: account.last_seen_marker,
        marker: replay.replay_id,
        notified,
    })
}
