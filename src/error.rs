//! Error types for replay-watch operations.
//!
//! Defines error types for the subsystems that reach outside the process:
//! - Replay statistics API calls
//! - Chat message delivery
//! - Job execution (the classification the worker pool acts on)
//!
//! Storage, queue, rate limiter and configuration errors live next to the
//! code that raises them and are wrapped by [`JobError`] here.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateLimitError;
use crate::scheduler::QueueError;
use crate::storage::StoreError;

/// Errors that can occur while calling the replay statistics API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("API key rejected ({code})")]
    Unauthorized { code: u16 },

    #[error("Rate limited by the replay statistics API")]
    RateLimited,

    #[error("API error ({code}): {message}")]
    Status { code: u16, message: String },

    #[error("Failed to decode API response: {0}")]
    Decode(String),

    #[error("Invalid API client configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::RequestFailed(err.to_string())
        }
    }
}

/// Errors that can occur while delivering a notification.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Rate limited by the messaging API")]
    RateLimited,

    #[error("Destination '{0}' not found or not accessible")]
    UnknownDestination(String),

    #[error("Messaging API error ({code}): {message}")]
    Status { code: u16, message: String },

    #[error("Invalid messenger configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::RequestFailed(err.to_string())
    }
}

/// Errors that can occur while executing a job.
///
/// The worker pool dead-letters permanent errors immediately and retries
/// everything else until the job runs out of attempts.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Tracked account {0} not found")]
    AccountNotFound(i64),

    #[error("Replay statistics API error: {0}")]
    Api(#[from] ApiError),

    #[error("Account store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Notification fan-out failed for {failed} of {total} subscriptions: {}", .destinations.join(", "))]
    FanOut {
        failed: usize,
        total: usize,
        destinations: Vec<String>,
    },

    #[error("Failed to release lock of account {account_id}: {source}")]
    LockRelease {
        account_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    /// Whether retrying the job can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            JobError::AccountNotFound(_) | JobError::InvalidInterval(_)
        )
    }
}
