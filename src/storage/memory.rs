//! In-process account store.
//!
//! Holds accounts and subscriptions behind one mutex so every operation is
//! atomic with respect to the others, mirroring the single-statement
//! guarantees of the Postgres store. Used by tests and local runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::store::{AccountStore, StoreError};
use super::types::{Subscription, TrackedAccount};

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<i64, TrackedAccount>,
    subscriptions: Vec<Subscription>,
    next_account_id: i64,
    next_subscription_id: i64,
}

/// [`AccountStore`] kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    state: Mutex<State>,
}

impl InMemoryAccountStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an account as-is.
    pub async fn insert_account(&self, account: TrackedAccount) {
        let mut state = self.state.lock().await;
        state.next_account_id = state.next_account_id.max(account.id);
        state.accounts.insert(account.id, account);
    }

    /// Returns a snapshot of an account.
    pub async fn account(&self, id: i64) -> Option<TrackedAccount> {
        self.state.lock().await.accounts.get(&id).cloned()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account(&self, id: i64) -> Result<Option<TrackedAccount>, StoreError> {
        Ok(self.account(id).await)
    }

    async fn find_stale_accounts(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<TrackedAccount>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .filter(|account| account.is_stale(stale_before))
            .cloned()
            .collect())
    }

    async fn try_lock(
        &self,
        id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.accounts.get_mut(&id) {
            Some(account) if account.is_stale(stale_before) => {
                account.locked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        account.locked_at = None;
        account.last_checked_at = Some(now);
        Ok(())
    }

    async fn update_marker(&self, id: i64, marker: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        account.last_seen_marker = Some(marker);
        Ok(())
    }

    async fn reap_stale_locks(&self, locked_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut reaped = 0;
        for account in state.accounts.values_mut() {
            if account.lock_expired(locked_before) {
                account.locked_at = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn subscriptions_for(&self, account_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn link_account(
        &self,
        owner_ref: &str,
        api_key: &str,
    ) -> Result<TrackedAccount, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(account) = state
            .accounts
            .values_mut()
            .find(|a| a.owner_ref == owner_ref)
        {
            account.api_key = api_key.to_string();
            return Ok(account.clone());
        }

        state.next_account_id += 1;
        let account = TrackedAccount::new(state.next_account_id, owner_ref, api_key);
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn subscribe(
        &self,
        account_id: i64,
        destination: &str,
    ) -> Result<Subscription, StoreError> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&account_id) {
            return Err(StoreError::NotFound(format!("account {}", account_id)));
        }
        if let Some(existing) = state
            .subscriptions
            .iter()
            .find(|s| s.account_id == account_id && s.destination == destination)
        {
            return Ok(existing.clone());
        }

        state.next_subscription_id += 1;
        let subscription = Subscription {
            id: state.next_subscription_id,
            account_id,
            destination: destination.to_string(),
            created_at: Utc::now(),
        };
        state.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn unsubscribe(&self, account_id: i64, destination: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| !(s.account_id == account_id && s.destination == destination));
        Ok(state.subscriptions.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_try_lock_is_exclusive() {
        let store = InMemoryAccountStore::new();
        store.insert_account(TrackedAccount::new(1, "owner", "key")).await;

        assert!(store.try_lock(1, t0(), t0()).await.unwrap());
        assert!(!store.try_lock(1, t0(), t0()).await.unwrap());
        assert_eq!(store.account(1).await.unwrap().locked_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_try_lock_unknown_account_is_skip() {
        let store = InMemoryAccountStore::new();
        assert!(!store.try_lock(99, t0(), t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_try_lock_rechecks_staleness() {
        let store = InMemoryAccountStore::new();
        store
            .insert_account(TrackedAccount::new(1, "owner", "key").with_last_checked_at(t0()))
            .await;

        let stale_before = t0() - Duration::seconds(1);
        assert!(!store.try_lock(1, t0(), stale_before).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_touches_last_checked() {
        let store = InMemoryAccountStore::new();
        store
            .insert_account(TrackedAccount::new(1, "owner", "key").with_locked_at(t0()))
            .await;

        let later = t0() + Duration::seconds(3);
        store.release_lock(1, later).await.unwrap();

        let account = store.account(1).await.unwrap();
        assert_eq!(account.locked_at, None);
        assert_eq!(account.last_checked_at, Some(later));
    }

    #[tokio::test]
    async fn test_release_unknown_account_is_not_found() {
        let store = InMemoryAccountStore::new();
        let err = store.release_lock(5, t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reap_only_expired_locks() {
        let store = InMemoryAccountStore::new();
        store
            .insert_account(TrackedAccount::new(1, "a", "key").with_locked_at(t0()))
            .await;
        store
            .insert_account(
                TrackedAccount::new(2, "b", "key").with_locked_at(t0() + Duration::seconds(10)),
            )
            .await;
        store.insert_account(TrackedAccount::new(3, "c", "key")).await;

        assert_eq!(store.reap_stale_locks(t0()).await.unwrap(), 1);
        assert!(store.account(1).await.unwrap().locked_at.is_none());
        assert!(store.account(2).await.unwrap().locked_at.is_some());
    }

    #[tokio::test]
    async fn test_link_account_updates_existing_owner() {
        let store = InMemoryAccountStore::new();
        let first = store.link_account("owner", "key-1").await.unwrap();
        let second = store.link_account("owner", "key-2").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.account(first.id).await.unwrap().api_key, "key-2");
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let store = InMemoryAccountStore::new();
        let account = store.link_account("owner", "key").await.unwrap();

        let a = store.subscribe(account.id, "chan-1").await.unwrap();
        let b = store.subscribe(account.id, "chan-1").await.unwrap();
        store.subscribe(account.id, "chan-2").await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(store.subscriptions_for(account.id).await.unwrap().len(), 2);

        assert!(store.unsubscribe(account.id, "chan-1").await.unwrap());
        assert!(!store.unsubscribe(account.id, "chan-1").await.unwrap());
        assert_eq!(store.subscriptions_for(account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_account() {
        let store = InMemoryAccountStore::new();
        assert!(matches!(
            store.subscribe(1, "chan").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
