//! Staleness scanner (`scan-stale`).

use tracing::{debug, error, info};

use crate::error::JobError;

use super::{cutoff, JobContext};

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Accounts returned by the staleness query.
    pub candidates: usize,
    /// Accounts whose conditional lock this scan won.
    pub locked: usize,
    /// Poll jobs enqueued.
    pub enqueued: usize,
    /// Accounts another scanner claimed first.
    pub skipped: usize,
}

/// Locks every stale account and enqueues a poll job for it.
///
/// The lock is written before the enqueue. A failure on one account does not
/// stop the others; the first such failure is returned once all candidates
/// were visited. A lock whose enqueue failed stays set until the reaper
/// clears it.
pub async fn scan_stale(ctx: &JobContext) -> Result<ScanReport, JobError> {
    let now = ctx.clock.now();
    let stale_before = cutoff(now, ctx.settings.update_interval)?;

    let candidates = ctx.store.find_stale_accounts(stale_before).await?;
    let mut report = ScanReport {
        candidates: candidates.len(),
        ..ScanReport::default()
    };
    let mut first_error: Option<JobError> = None;

    for account in candidates {
        match ctx.store.try_lock(account.id, now, stale_before).await {
            Ok(true) => report.locked += 1,
            Ok(false) => {
                debug!(account_id = account.id, "Account claimed by another scan, skipping");
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                error!(account_id = account.id, error = %e, "Failed to lock account");
                first_error.get_or_insert(e.into());
                continue;
            }
        }

        match ctx.enqueuer.enqueue_now(ctx.poll_job(account.id)).await {
            Ok(()) => report.enqueued += 1,
            Err(e) => {
                error!(
                    account_id = account.id,
                    error = %e,
                    "Failed to enqueue poll job, lock left for the reaper"
                );
                first_error.get_or_insert(e.into());
            }
        }
    }

    ctx.metrics.record_locks_acquired(report.locked as u64);
    if report.candidates > 0 {
        info!(
            candidates = report.candidates,
            enqueued = report.enqueued,
            skipped = report.skipped,
            "Scanned for stale accounts"
        );
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
