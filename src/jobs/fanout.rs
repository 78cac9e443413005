//! Notification fan-out to every subscription of an account.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::notify::replay_embed;
use crate::replays::Replay;

use super::JobContext;

/// Sends the replay embed to each subscription of `account_id`.
///
/// Deliveries run concurrently and one failure does not cancel the others.
/// Returns the number delivered, or `JobError::FanOut` if any failed.
pub async fn notify_subscribers(
    ctx: &JobContext,
    account_id: i64,
    replay: &Replay,
) -> Result<usize, JobError> {
    let subscriptions = ctx.store.subscriptions_for(account_id).await?;
    if subscriptions.is_empty() {
        debug!(account_id = account_id, "No subscriptions to notify");
        return Ok(0);
    }

    let embed = replay_embed(replay);
    let deliveries = subscriptions.iter().map(|subscription| {
        let embed = &embed;
        async move {
            let result = ctx.messenger.deliver(&subscription.destination, embed).await;
            (subscription, result)
        }
    });

    let total = subscriptions.len();
    let mut failed_destinations = Vec::new();
    for (subscription, result) in join_all(deliveries).await {
        ctx.metrics.record_notification(result.is_ok());
        if let Err(e) = result {
            failed_destinations.push(subscription.destination.clone());
            warn!(
                account_id = account_id,
                destination = %subscription.destination,
                error = %e,
                "Notification delivery failed"
            );
        }
    }

    if !failed_destinations.is_empty() {
        return Err(JobError::FanOut {
            failed: failed_destinations.len(),
            total,
            destinations: failed_destinations,
        });
    }

    debug!(account_id = account_id, delivered = total, "Notified subscribers");
    Ok(total)
}
