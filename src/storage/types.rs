//! Persistent records of the account store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An account whose latest replay is polled periodically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrackedAccount {
    /// Stable identifier, carried by `poll-account` jobs.
    pub id: i64,
    /// Reference to the owning user in the chat platform.
    pub owner_ref: String,
    /// Credential for the replay statistics API. Opaque here.
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Identifier of the most recently observed replay.
    pub last_seen_marker: Option<i64>,
    /// When the last check completed, successfully or not.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Set while a check is owned by an in-flight job.
    pub locked_at: Option<DateTime<Utc>>,
    /// When the credential was first linked.
    pub created_at: DateTime<Utc>,
}

impl TrackedAccount {
    /// Creates an unlocked, never-checked account.
    pub fn new(id: i64, owner_ref: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id,
            owner_ref: owner_ref.into(),
            api_key: api_key.into(),
            last_seen_marker: None,
            last_checked_at: None,
            locked_at: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the last seen marker.
    pub fn with_marker(mut self, marker: i64) -> Self {
        self.last_seen_marker = Some(marker);
        self
    }

    /// Sets the last check time.
    pub fn with_last_checked_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_checked_at = Some(at);
        self
    }

    /// Sets the lock time.
    pub fn with_locked_at(mut self, at: DateTime<Utc>) -> Self {
        self.locked_at = Some(at);
        self
    }

    /// Whether a check is currently owned by some job.
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Whether the account is due for a check given the staleness cutoff.
    ///
    /// Matches the scanner's query: unlocked, and never checked or last
    /// checked at or before `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.locked_at.is_none()
            && self
                .last_checked_at
                .map_or(true, |checked| checked <= stale_before)
    }

    /// Whether the lock is old enough to be reclaimed.
    pub fn lock_expired(&self, locked_before: DateTime<Utc>) -> bool {
        self.locked_at
            .is_some_and(|locked| locked <= locked_before)
    }

    /// Whether `marker` differs from the last seen one.
    ///
    /// Strict inequality: markers are not assumed to be monotonic.
    pub fn marker_changed(&self, marker: i64) -> bool {
        self.last_seen_marker != Some(marker)
    }
}

/// A destination that is notified about new replays of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Row identifier.
    pub id: i64,
    /// Tracked account this subscription follows.
    pub account_id: i64,
    /// Channel reference understood by the messenger.
    pub destination: String,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}
