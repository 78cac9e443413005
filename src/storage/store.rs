//! Account store contract used by the scanner, reaper and poll executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::migrations::MigrationError;
use super::types::{Subscription, TrackedAccount};

/// Errors that can occur during account store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Persistence for tracked accounts and their subscriptions.
///
/// Every mutation is a single statement. The lock is the `locked_at` value of
/// the account row; there is no lock table and no transaction spans a job.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Loads one account.
    async fn get_account(&self, id: i64) -> Result<Option<TrackedAccount>, StoreError>;

    /// Lists unlocked accounts never checked or last checked at or before
    /// `stale_before`.
    async fn find_stale_accounts(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<TrackedAccount>, StoreError>;

    /// Sets `locked_at = now` if the account is still unlocked and stale.
    ///
    /// Returns `false` when another scanner got there first; that is not an
    /// error.
    async fn try_lock(
        &self,
        id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clears the lock and records `now` as the last check time.
    async fn release_lock(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Persists a newly observed marker.
    async fn update_marker(&self, id: i64, marker: i64) -> Result<(), StoreError>;

    /// Clears every lock set at or before `locked_before`.
    ///
    /// Returns the number of accounts unlocked.
    async fn reap_stale_locks(&self, locked_before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Lists the subscriptions of an account.
    async fn subscriptions_for(&self, account_id: i64) -> Result<Vec<Subscription>, StoreError>;

    /// Creates an account for `owner_ref`, or replaces its API key.
    async fn link_account(
        &self,
        owner_ref: &str,
        api_key: &str,
    ) -> Result<TrackedAccount, StoreError>;

    /// Subscribes `destination` to an account. Idempotent.
    async fn subscribe(
        &self,
        account_id: i64,
        destination: &str,
    ) -> Result<Subscription, StoreError>;

    /// Removes a subscription. Returns whether one existed.
    async fn unsubscribe(&self, account_id: i64, destination: &str) -> Result<bool, StoreError>;
}
