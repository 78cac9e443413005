//! Runtime configuration for the replay watcher.
//!
//! This module provides configuration for the worker process: backing
//! stores, worker pool sizing, staleness and lock thresholds, the shared
//! rate budget for the replay statistics API, throttled-retry backoff and the
//! periodic job schedules.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateQuota;
use crate::scheduler::{BackoffWindow, HEARTBEAT_TTL};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the replay watcher.
#[derive(Debug, Clone)]
pub struct Config {
    // Backing stores
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of pooled database connections.
    pub db_max_connections: u32,
    /// Redis connection URL (queue and rate limiter state).
    pub redis_url: String,

    // Worker settings
    /// Prefix for every Redis key this process touches.
    pub namespace: String,
    /// Number of concurrent workers in the pool.
    pub concurrency: usize,
    /// Maximum time allowed for a single job.
    pub job_timeout: Duration,
    /// Time to wait for in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,
    /// Blocking dequeue wait and delayed-job promotion cadence.
    pub poll_interval: Duration,
    /// Attempts before a failing job is dead-lettered.
    pub max_attempts: u32,

    // Scheduling policy
    /// Minimum age of the last check before an account is polled again.
    pub update_interval: Duration,
    /// Age after which a held lock is considered abandoned.
    pub lock_ttl: Duration,
    /// Sustained replay API requests per second across all workers.
    pub rate_limit_average: f64,
    /// Requests allowed to exceed the sustained rate in a single burst.
    pub rate_limit_burst: u32,
    /// Lower bound (inclusive) of the throttled-retry delay.
    pub backoff_low: Duration,
    /// Upper bound (exclusive) of the throttled-retry delay.
    pub backoff_high: Duration,
    /// Cron schedule (with seconds) of the staleness scan.
    pub scan_cron: String,
    /// Cron schedule (with seconds) of the stale-lock sweep.
    pub reap_cron: String,

    // External services
    /// Base URL of the replay statistics API.
    pub api_base_url: String,
    /// Timeout for a single replay statistics API call.
    pub api_timeout: Duration,
    /// Discord bot token used for notifications.
    pub discord_token: Option<String>,
    /// Base URL of the Discord REST API.
    pub discord_api_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/replay_watch".to_string(),
            db_max_connections: 10,
            redis_url: "redis://127.0.0.1:6379".to_string(),

            namespace: "replay-watch".to_string(),
            concurrency: 5,
            job_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            max_attempts: 4,

            update_interval: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(600),
            rate_limit_average: 1.0,
            rate_limit_burst: 5,
            backoff_low: Duration::from_secs(5),
            backoff_high: Duration::from_secs(60),
            scan_cron: "0 * * * * *".to_string(),
            reap_cron: "30 * * * * *".to_string(),

            api_base_url: "https://api.sc2replaystats.com".to_string(),
            api_timeout: Duration::from_secs(10),
            discord_token: None,
            discord_api_base_url: "https://discord.com/api/v10".to_string(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `DB_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379)
    /// - `WORKER_NAMESPACE`: Redis key prefix (default: replay-watch)
    /// - `WORKER_CONCURRENCY`: Number of workers (default: 5)
    /// - `WORKER_JOB_TIMEOUT_SECS`: Per-job timeout (default: 60)
    /// - `WORKER_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown wait (default: 30)
    /// - `WORKER_POLL_INTERVAL_SECS`: Dequeue wait (default: 1)
    /// - `WORKER_MAX_ATTEMPTS`: Attempts before dead-lettering (default: 4)
    /// - `REPLAYS_UPDATE_INTERVAL_SECS`: Staleness threshold (default: 300)
    /// - `REPLAYS_LOCK_TTL_SECS`: Lock reclaim threshold (default: 600)
    /// - `REPLAYS_RATE_LIMIT_AVERAGE`: Requests per second (default: 1.0)
    /// - `REPLAYS_RATE_LIMIT_BURST`: Burst allowance (default: 5)
    /// - `REPLAYS_BACKOFF_LOW_SECS`: Throttled retry lower bound (default: 5)
    /// - `REPLAYS_BACKOFF_HIGH_SECS`: Throttled retry upper bound (default: 60)
    /// - `REPLAYS_API_BASE_URL`: Replay statistics API base URL
    /// - `REPLAYS_API_TIMEOUT_SECS`: API call timeout (default: 10)
    /// - `SCAN_CRON`: Staleness scan schedule (default: `0 * * * * *`)
    /// - `REAP_CRON`: Stale-lock sweep schedule (default: `30 * * * * *`)
    /// - `DISCORD_TOKEN`: Bot token for notifications
    /// - `DISCORD_API_BASE_URL`: Discord REST base URL
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage settings - DATABASE_URL is required
        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Some(val) = env_value("DB_MAX_CONNECTIONS")? {
            config.db_max_connections = val;
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        // Worker settings
        if let Ok(val) = std::env::var("WORKER_NAMESPACE") {
            config.namespace = val;
        }

        if let Some(val) = env_value("WORKER_CONCURRENCY")? {
            config.concurrency = val;
        }

        if let Some(secs) = env_value("WORKER_JOB_TIMEOUT_SECS")? {
            config.job_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_value("WORKER_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_value("WORKER_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(val) = env_value("WORKER_MAX_ATTEMPTS")? {
            config.max_attempts = val;
        }

        // Scheduling policy
        if let Some(secs) = env_value("REPLAYS_UPDATE_INTERVAL_SECS")? {
            config.update_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = env_value("REPLAYS_LOCK_TTL_SECS")? {
            config.lock_ttl = Duration::from_secs(secs);
        }

        if let Some(val) = env_value("REPLAYS_RATE_LIMIT_AVERAGE")? {
            config.rate_limit_average = val;
        }

        if let Some(val) = env_value("REPLAYS_RATE_LIMIT_BURST")? {
            config.rate_limit_burst = val;
        }

        if let Some(secs) = env_value("REPLAYS_BACKOFF_LOW_SECS")? {
            config.backoff_low = Duration::from_secs(secs);
        }

        if let Some(secs) = env_value("REPLAYS_BACKOFF_HIGH_SECS")? {
            config.backoff_high = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("SCAN_CRON") {
            config.scan_cron = val;
        }

        if let Ok(val) = std::env::var("REAP_CRON") {
            config.reap_cron = val;
        }

        // External services
        if let Ok(val) = std::env::var("REPLAYS_API_BASE_URL") {
            config.api_base_url = val;
        }

        if let Some(secs) = env_value("REPLAYS_API_TIMEOUT_SECS")? {
            config.api_timeout = Duration::from_secs(secs);
        }

        config.discord_token = std::env::var("DISCORD_TOKEN").ok();

        if let Ok(val) = std::env::var("DISCORD_API_BASE_URL") {
            config.discord_api_base_url = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.namespace.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        // The promoter refreshes the consumer heartbeat once per poll interval.
        if self.poll_interval.is_zero() || self.poll_interval * 3 > HEARTBEAT_TTL {
            return Err(ConfigError::ValidationFailed(format!(
                "poll_interval must be between 1s and {}s",
                HEARTBEAT_TTL.as_secs() / 3
            )));
        }

        if self.update_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "update_interval must be greater than 0".to_string(),
            ));
        }

        if !(self.rate_limit_average > 0.0 && self.rate_limit_average.is_finite()) {
            return Err(ConfigError::ValidationFailed(
                "rate_limit_average must be a positive number".to_string(),
            ));
        }

        self.throttle_backoff()?;

        // A lock must outlive one throttled deferral plus one full job run.
        let worst_case_job = self.backoff_high + self.job_timeout;
        if self.lock_ttl <= worst_case_job {
            return Err(ConfigError::ValidationFailed(format!(
                "lock_ttl ({}s) must exceed backoff_high + job_timeout ({}s)",
                self.lock_ttl.as_secs(),
                worst_case_job.as_secs()
            )));
        }

        for (key, spec) in [("scan_cron", &self.scan_cron), ("reap_cron", &self.reap_cron)] {
            cron::Schedule::from_str(spec).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Returns the shared replay API quota.
    pub fn rate_quota(&self) -> RateQuota {
        RateQuota::per_second(self.rate_limit_average, self.rate_limit_burst)
    }

    /// Returns the delay window used for throttled retries.
    pub fn throttle_backoff(&self) -> Result<BackoffWindow, ConfigError> {
        BackoffWindow::new(self.backoff_low, self.backoff_high)
            .map_err(|message| ConfigError::ValidationFailed(message.to_string()))
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set worker concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Builder method to set the staleness threshold.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Builder method to set the lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Builder method to set the rate limit.
    pub fn with_rate_limit(mut self, average: f64, burst: u32) -> Self {
        self.rate_limit_average = average;
        self.rate_limit_burst = burst;
        self
    }

    /// Builder method to set the throttled-retry window.
    pub fn with_backoff(mut self, low: Duration, high: Duration) -> Self {
        self.backoff_low = low;
        self.backoff_high = high;
        self
    }

    /// Builder method to set the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the Discord token.
    pub fn with_discord_token(mut self, token: impl Into<String>) -> Self {
        self.discord_token = Some(token.into());
        self
    }
}

/// Reads and parses an optional environment variable.
fn env_value<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => parse_env_value(&val, key).map(Some),
        Err(_) => Ok(None),
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
