//! HTTP client for the replay statistics API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::ApiError;

use super::types::Replay;
use super::StatsApi;

/// Default base URL of the replay statistics API.
pub const DEFAULT_BASE_URL: &str = "https://api.sc2replaystats.com";

/// Client for `GET {base}/account/last-replay`.
///
/// The account's API key goes verbatim into the `Authorization` header.
#[derive(Debug, Clone)]
pub struct ReplayStatsClient {
    base_url: String,
    timeout: Duration,
    http_client: Client,
}

impl ReplayStatsClient {
    /// Creates a client for `base_url` whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidConfig` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            http_client,
        })
    }

    /// Get the API base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout(self.timeout)
        } else {
            ApiError::from(err)
        }
    }
}

#[async_trait]
impl StatsApi for ReplayStatsClient {
    async fn latest_replay(&self, api_key: &str) -> Result<Replay, ApiError> {
        let url = format!("{}/account/last-replay", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", api_key)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_send_error(e))?;

        match status {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ApiError::Unauthorized {
                    code: status.as_u16(),
                });
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(ApiError::RateLimited),
            _ => {
                return Err(ApiError::Status {
                    code: status.as_u16(),
                    message: body,
                });
            }
        }

        let replay: Replay =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;

        debug!(replay_id = replay.replay_id, "Fetched last replay");
        Ok(replay)
    }
}
