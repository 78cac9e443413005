//! Notification delivery to chat channels.

pub mod discord;
pub mod embed;

use async_trait::async_trait;

use crate::error::DeliveryError;

pub use discord::DiscordMessenger;
pub use embed::{replay_embed, Embed, EmbedField, EmbedFooter};

/// Delivers a formatted message to one destination.
///
/// One attempt per call; retries are the caller's business.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn deliver(&self, destination: &str, embed: &Embed) -> Result<(), DeliveryError>;
}
