//! Redis-backed GCRA limiter shared by every worker process.
//!
//! The theoretical arrival time of each key is stored under
//! `{namespace}:ratelimit:{key}`. Reading, deciding and writing happen in a
//! single Lua script so concurrent requests from many processes are
//! serialized by Redis. The script uses the Redis server clock, which keeps
//! processes with skewed local clocks on the same timeline.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{RateLimitError, RateLimitResult, RateLimiter, RateQuota};

/// Mirror of [`super::gcra::decide`] executed inside Redis.
///
/// KEYS[1] = state key; ARGV = emission interval (µs), tolerance (µs), quantity.
/// Returns `{limited, remaining, retry_after_us (-1 = never), reset_after_us}`.
const GCRA_SCRIPT: &str = r#"
local emission = tonumber(ARGV[1])
local tolerance = tonumber(ARGV[2])
local quantity = tonumber(ARGV[3])

local clock = redis.call('TIME')
local now = tonumber(clock[1]) * 1000000 + tonumber(clock[2])

local tat = tonumber(redis.call('GET', KEYS[1]))
if tat == nil or tat < now then
  tat = now
end

local increment = emission * quantity
local new_tat = tat + increment
local allow_at = new_tat - tolerance
local diff = now - allow_at

if diff < 0 then
  local retry_after = -1
  if increment <= tolerance then
    retry_after = -diff
  end
  return {1, 0, retry_after, tat - now}
end

local ttl = new_tat - now
redis.call('SET', KEYS[1], string.format('%.0f', new_tat), 'PX', math.max(1, math.ceil(ttl / 1000)))
return {0, math.floor(diff / emission), -1, ttl}
"#;

/// GCRA limiter with state in Redis.
#[derive(Clone)]
pub struct RedisRateLimiter {
    redis: ConnectionManager,
    key_prefix: String,
    quota: RateQuota,
    script: redis::Script,
}

impl RedisRateLimiter {
    /// Creates a limiter storing its state under `{namespace}:ratelimit:`.
    pub fn new(redis: ConnectionManager, namespace: &str, quota: RateQuota) -> Self {
        Self {
            redis,
            key_prefix: format!("{}:ratelimit", namespace),
            quota,
            script: redis::Script::new(GCRA_SCRIPT),
        }
    }

    /// Returns the Redis key holding the state of `key`.
    pub fn state_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn rate_limit(&self, key: &str, quantity: u32) -> Result<RateLimitResult, RateLimitError> {
        let mut conn = self.redis.clone();

        let reply: Vec<i64> = self
            .script
            .key(self.state_key(key))
            .arg(self.quota.emission_micros())
            .arg(self.quota.tolerance_micros())
            .arg(quantity)
            .invoke_async(&mut conn)
            .await?;

        parse_reply(&reply)
    }
}

fn parse_reply(reply: &[i64]) -> Result<RateLimitResult, RateLimitError> {
    let [limited, remaining, retry_after, reset_after] = reply else {
        return Err(RateLimitError::UnexpectedResponse(format!(
            "expected 4 integers, got {:?}",
            reply
        )));
    };

    Ok(RateLimitResult {
        limited: *limited != 0,
        remaining: u32::try_from(*remaining).unwrap_or(u32::MAX),
        retry_after: u64::try_from(*retry_after).ok().map(Duration::from_micros),
        reset_after: Duration::from_micros(u64::try_from(*reset_after).unwrap_or(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admitted_reply() {
        let result = parse_reply(&[0, 4, -1, 2_000_000]).unwrap();
        assert!(!result.limited);
        assert_eq!(result.remaining, 4);
        assert_eq!(result.retry_after, None);
        assert_eq!(result.reset_after, Duration::from_secs(2));
    }

    #[test]
    fn test_parse_limited_reply() {
        let result = parse_reply(&[1, 0, 250_000, 6_000_000]).unwrap();
        assert!(result.limited);
        assert_eq!(result.retry_after, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_parse_malformed_reply() {
        let err = parse_reply(&[1, 0]).unwrap_err();
        assert!(err.to_string().contains("expected 4 integers"));
    }

    #[test]
    fn test_script_mirrors_tolerance_rule() {
        // The Lua script and gcra::decide must agree on the admission rule.
        assert!(GCRA_SCRIPT.contains("local allow_at = new_tat - tolerance"));
        assert!(GCRA_SCRIPT.contains("if increment <= tolerance then"));
    }
}
