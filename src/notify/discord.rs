//! Discord REST messenger.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::error::DeliveryError;

use super::embed::Embed;
use super::Messenger;

/// Default base URL of the Discord REST API.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

#[derive(Serialize)]
struct CreateMessage<'a> {
    embeds: [&'a Embed; 1],
}

/// Posts embeds to Discord channels as a bot.
#[derive(Debug, Clone)]
pub struct DiscordMessenger {
    base_url: String,
    token: String,
    http_client: Client,
}

impl DiscordMessenger {
    /// Creates a messenger authenticating with the bot `token`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidConfig` for an empty token or if the
    /// HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "bot token must not be empty".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }
}

#[async_trait]
impl Messenger for DiscordMessenger {
    async fn deliver(&self, destination: &str, embed: &Embed) -> Result<(), DeliveryError> {
        let url = format!("{}/channels/{}/messages", self.base_url, destination);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&CreateMessage { embeds: [embed] })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        match status {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                Err(DeliveryError::UnknownDestination(destination.to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(DeliveryError::RateLimited),
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Failed to read error response".to_string());
                Err(DeliveryError::Status {
                    code: status.as_u16(),
                    message,
                })
            }
        }
    }
}
