//! GCRA decision function shared by every limiter backend.
//!
//! Times are integer microseconds since the Unix epoch. The Redis backend
//! runs the same arithmetic inside its Lua script; keep the two in sync.

use std::time::Duration;

use super::{RateLimitResult, RateQuota};

/// Result of evaluating one request against the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcraDecision {
    /// What the caller is told.
    pub result: RateLimitResult,
    /// New theoretical arrival time to store, if the request was admitted.
    pub new_tat: Option<i64>,
}

/// Evaluates a request for `quantity` units at `now`.
///
/// `stored_tat` is the key's theoretical arrival time, `None` for a key
/// that has never been seen or has expired.
pub fn decide(quota: &RateQuota, stored_tat: Option<i64>, now: i64, quantity: u32) -> GcraDecision {
    let emission = quota.emission_micros();
    let tolerance = quota.tolerance_micros();
    let increment = emission.saturating_mul(i64::from(quantity));

    let tat = stored_tat.unwrap_or(now).max(now);
    let new_tat = tat.saturating_add(increment);
    let allow_at = new_tat.saturating_sub(tolerance);
    let diff = now.saturating_sub(allow_at);

    if diff < 0 {
        // A request larger than the whole tolerance can never fit.
        let retry_after = (increment <= tolerance).then(|| micros(diff.saturating_neg()));
        return GcraDecision {
            result: RateLimitResult {
                limited: true,
                remaining: 0,
                retry_after,
                reset_after: micros(tat - now),
            },
            new_tat: None,
        };
    }

    let remaining = if emission > 0 {
        u32::try_from(diff / emission).unwrap_or(u32::MAX)
    } else {
        u32::MAX
    };

    GcraDecision {
        result: RateLimitResult {
            limited: false,
            remaining,
            retry_after: None,
            reset_after: micros(new_tat - now),
        },
        new_tat: Some(new_tat),
    }
}

fn micros(value: i64) -> Duration {
    Duration::from_micros(u64::try_from(value).unwrap_or(0))
}
