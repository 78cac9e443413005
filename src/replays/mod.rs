//! Replay statistics API.
//!
//! The poll executor only needs the latest replay of an account; that is the
//! whole [`StatsApi`] surface.

pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::error::ApiError;

pub use client::{ReplayStatsClient, DEFAULT_BASE_URL};
pub use types::{Player, PlayerColor, Race, Replay};

/// Source of the most recent replay of an account.
#[async_trait]
pub trait StatsApi: Send + Sync {
    /// Fetches the latest replay visible with `api_key`.
    async fn latest_replay(&self, api_key: &str) -> Result<Replay, ApiError>;
}
