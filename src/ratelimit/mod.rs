//! Shared admission control for calls to the replay statistics API.
//!
//! Every poll job asks the limiter for one unit before touching the remote
//! API. The limiter implements GCRA (generic cell rate algorithm): each key
//! keeps a single "theoretical arrival time" that advances by one emission
//! interval per admitted unit, which replenishes the budget smoothly instead
//! of resetting it at window boundaries.
//!
//! - **RedisRateLimiter**: state lives in Redis and is updated by a Lua
//!   script, so every worker process sharing the Redis shares one budget.
//! - **InMemoryRateLimiter**: same algorithm for single-process use and tests.

pub mod gcra;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryRateLimiter;
pub use redis_store::RedisRateLimiter;

/// Errors that can occur while consulting the rate limiter.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The limiter script returned something unexpected.
    #[error("Unexpected rate limiter response: {0}")]
    UnexpectedResponse(String),
}

/// Sustained rate and burst allowance for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    /// Time between two units at the sustained rate.
    pub emission_interval: Duration,
    /// Units allowed to exceed the sustained rate at once.
    pub max_burst: u32,
}

impl RateQuota {
    /// Creates a quota of `rate` units per second with the given burst.
    ///
    /// Non-positive or non-finite rates yield a quota that never replenishes.
    pub fn per_second(rate: f64, max_burst: u32) -> Self {
        let emission_interval = if rate > 0.0 && rate.is_finite() {
            Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };

        Self {
            emission_interval,
            max_burst,
        }
    }

    /// Emission interval in microseconds, saturating at `i64::MAX`.
    pub fn emission_micros(&self) -> i64 {
        i64::try_from(self.emission_interval.as_micros()).unwrap_or(i64::MAX)
    }

    /// Delay variation tolerance in microseconds.
    ///
    /// A key may run `max_burst + 1` emission intervals ahead of now.
    pub fn tolerance_micros(&self) -> i64 {
        self.emission_micros()
            .saturating_mul(i64::from(self.max_burst) + 1)
    }
}

/// Outcome of a single admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request was denied.
    pub limited: bool,
    /// Units that could still be admitted right now.
    pub remaining: u32,
    /// When a denied request could succeed; `None` if it never can.
    pub retry_after: Option<Duration>,
    /// Time until the key is back to its full burst.
    pub reset_after: Duration,
}

/// Admission-control gate.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Requests `quantity` units for `key`.
    async fn rate_limit(&self, key: &str, quantity: u32) -> Result<RateLimitResult, RateLimitError>;
}
