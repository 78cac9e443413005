//! In-process GCRA limiter.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::gcra;
use super::{RateLimitError, RateLimitResult, RateLimiter, RateQuota};

/// GCRA limiter whose state lives in this process only.
///
/// Workers in the same process share the budget; other processes do not.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    quota: RateQuota,
    tats: Mutex<HashMap<String, i64>>,
}

impl InMemoryRateLimiter {
    /// Creates a limiter enforcing `quota` on every key.
    pub fn new(quota: RateQuota) -> Self {
        Self {
            quota,
            tats: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured quota.
    pub fn quota(&self) -> RateQuota {
        self.quota
    }

    /// Evaluates a request as if it arrived at `now`.
    pub async fn rate_limit_at(&self, key: &str, quantity: u32, now: DateTime<Utc>) -> RateLimitResult {
        let now = now.timestamp_micros();
        let mut tats = self.tats.lock().await;

        // Entries past their TAT carry no information; drop them so the map
        // stays bounded by the number of recently active keys.
        tats.retain(|_, tat| *tat > now);

        let decision = gcra::decide(&self.quota, tats.get(key).copied(), now, quantity);
        if let Some(new_tat) = decision.new_tat {
            tats.insert(key.to_string(), new_tat);
        }
        decision.result
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn rate_limit(&self, key: &str, quantity: u32) -> Result<RateLimitResult, RateLimitError> {
        Ok(self.rate_limit_at(key, quantity, Utc::now()).await)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_keys_have_independent_budgets() {
        let limiter = InMemoryRateLimiter::new(RateQuota::per_second(1.0, 0));

        assert!(!limiter.rate_limit_at("a", 1, t0()).await.limited);
        assert!(limiter.rate_limit_at("a", 1, t0()).await.limited);
        assert!(!limiter.rate_limit_at("b", 1, t0()).await.limited);
    }

    #[tokio::test]
    async fn test_budget_recovers_over_time() {
        let limiter = InMemoryRateLimiter::new(RateQuota::per_second(2.0, 1));

        assert!(!limiter.rate_limit_at("poll", 1, t0()).await.limited);
        assert!(!limiter.rate_limit_at("poll", 1, t0()).await.limited);
        let denied = limiter.rate_limit_at("poll", 1, t0()).await;
        assert!(denied.limited);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(500)));

        let later = t0() + chrono::Duration::milliseconds(500);
        assert!(!limiter.rate_limit_at("poll", 1, later).await.limited);
    }

    #[tokio::test]
    async fn test_trait_uses_wall_clock() {
        let limiter = InMemoryRateLimiter::new(RateQuota::per_second(10.0, 2));
        let result = limiter.rate_limit("poll", 1).await.unwrap();
        assert!(!result.limited);
        assert_eq!(result.remaining, 2);
    }
}
