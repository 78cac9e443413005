//! replay-watch: scheduled polling of a replay statistics API.
//!
//! This library keeps tracked accounts fresh under a shared rate budget:
//! a periodic scan locks stale accounts and enqueues poll jobs, workers
//! fetch each account's latest replay, and new replays are announced to
//! every subscribed channel.

pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod ratelimit;
pub mod replays;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{ApiError, DeliveryError, JobError};
