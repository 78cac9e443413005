//! Stale-lock reaper (`reap-locks`).

use tracing::{debug, warn};

use crate::error::JobError;

use super::{cutoff, JobContext};

/// Clears every lock taken at or before `now - lock_ttl`.
///
/// The reaper cannot tell a dead job from a slow one. A poll deferred by
/// several throttled rounds may lose its lock here and be scanned again while
/// its own retry is still queued; the marker comparison keeps that harmless
/// for the stored state.
pub async fn reap_locks(ctx: &JobContext) -> Result<u64, JobError> {
    let locked_before = cutoff(ctx.clock.now(), ctx.settings.lock_ttl)?;
    let reaped = ctx.store.reap_stale_locks(locked_before).await?;

    ctx.metrics.record_locks_reaped(reaped);
    if reaped > 0 {
        warn!(reaped = reaped, locked_before = %locked_before, "Reclaimed abandoned account locks");
    } else {
        debug!("No abandoned account locks");
    }

    Ok(reaped)
}
