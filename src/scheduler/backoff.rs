//! Delays for deferred and retried jobs.

use std::time::Duration;

use rand::RngExt;

/// Window from which throttled poll jobs draw their deferral delay.
///
/// Delays are whole seconds drawn uniformly from `[low, high)`, so many
/// accounts throttled at the same instant spread their retries out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffWindow {
    low_secs: u64,
    high_secs: u64,
}

impl BackoffWindow {
    /// Creates a window. `low` must be at least one second and below `high`.
    pub fn new(low: Duration, high: Duration) -> Result<Self, &'static str> {
        let (low_secs, high_secs) = (low.as_secs(), high.as_secs());
        if low_secs == 0 {
            return Err("backoff lower bound must be at least one second");
        }
        if high_secs <= low_secs {
            return Err("backoff upper bound must exceed the lower bound");
        }
        Ok(Self {
            low_secs,
            high_secs,
        })
    }

    /// Lower bound, inclusive.
    pub fn low(&self) -> Duration {
        Duration::from_secs(self.low_secs)
    }

    /// Upper bound, exclusive.
    pub fn high(&self) -> Duration {
        Duration::from_secs(self.high_secs)
    }

    /// Draws a delay.
    pub fn sample(&self) -> Duration {
        let secs = rand::rng().random_range(self.low_secs..self.high_secs);
        Duration::from_secs(secs)
    }

    /// Whether `delay` lies in the window.
    pub fn contains(&self, delay: Duration) -> bool {
        delay >= self.low() && delay < self.high()
    }
}

/// Delay before retrying a job that failed `attempts` times.
///
/// `attempts^4 + 15 + rand(0..30) * (attempts + 1)` seconds, which grows fast
/// enough that a broken downstream is not hammered.
pub fn retry_backoff(attempts: u32) -> Duration {
    let attempts = u64::from(attempts);
    let jitter = rand::rng().random_range(0..30u64);
    let secs = attempts
        .saturating_pow(4)
        .saturating_add(15)
        .saturating_add(jitter.saturating_mul(attempts + 1));
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_rejects_bad_bounds() {
        assert!(BackoffWindow::new(Duration::ZERO, Duration::from_secs(5)).is_err());
        assert!(BackoffWindow::new(Duration::from_secs(5), Duration::from_secs(5)).is_err());
        assert!(BackoffWindow::new(Duration::from_secs(9), Duration::from_secs(5)).is_err());
        // Sub-second remainders are dropped
        assert!(BackoffWindow::new(Duration::from_millis(500), Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_samples_stay_in_window() {
        let window = BackoffWindow::new(Duration::from_secs(5), Duration::from_secs(60)).unwrap();
        for _ in 0..1000 {
            let delay = window.sample();
            assert!(window.contains(delay), "{:?} outside window", delay);
            assert!(delay > Duration::ZERO);
        }
    }

    #[test]
    fn test_narrow_window_is_deterministic() {
        let window = BackoffWindow::new(Duration::from_secs(7), Duration::from_secs(8)).unwrap();
        assert_eq!(window.sample(), Duration::from_secs(7));
        assert!(!window.contains(Duration::from_secs(8)));
    }

    #[test]
    fn test_retry_backoff_bounds() {
        for attempts in 0..6u32 {
            let base = u64::from(attempts).pow(4) + 15;
            let max = base + 29 * (u64::from(attempts) + 1);
            for _ in 0..100 {
                let secs = retry_backoff(attempts).as_secs();
                assert!(secs >= base && secs <= max, "{} not in [{}, {}]", secs, base, max);
            }
        }
    }
}
