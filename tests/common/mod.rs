//! Shared fakes for the scheduling tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use replay_watch::error::{ApiError, DeliveryError};
use replay_watch::jobs::{Clock, JobContext, SchedulingSettings};
use replay_watch::notify::{Embed, Messenger};
use replay_watch::ratelimit::{RateLimitError, RateLimitResult, RateLimiter};
use replay_watch::replays::{Replay, StatsApi};
use replay_watch::scheduler::{BackoffWindow, Job, JobEnqueuer, QueueError};
use replay_watch::storage::{
    AccountStore, InMemoryAccountStore, StoreError, Subscription, TrackedAccount,
};

pub const UPDATE_INTERVAL: Duration = Duration::from_secs(300);
pub const LOCK_TTL: Duration = Duration::from_secs(300);

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Clock moved by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Records every enqueued job and its delay.
#[derive(Default)]
pub struct RecordingEnqueuer {
    jobs: Mutex<Vec<(Job, Option<Duration>)>>,
    fail: AtomicBool,
}

impl RecordingEnqueuer {
    pub fn failing() -> Self {
        let enqueuer = Self::default();
        enqueuer.fail.store(true, Ordering::SeqCst);
        enqueuer
    }

    pub fn jobs(&self) -> Vec<(Job, Option<Duration>)> {
        self.jobs.lock().unwrap().clone()
    }

    fn push(&self, job: Job, delay: Option<Duration>) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionFailed("queue down".to_string()));
        }
        self.jobs.lock().unwrap().push((job, delay));
        Ok(())
    }
}

#[async_trait]
impl JobEnqueuer for RecordingEnqueuer {
    async fn enqueue_now(&self, job: Job) -> Result<(), QueueError> {
        self.push(job, None)
    }

    async fn enqueue_after(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        self.push(job, Some(delay))
    }
}

/// Limiter that admits or denies everything and remembers the keys asked for.
#[derive(Default)]
pub struct ScriptedLimiter {
    deny: AtomicBool,
    broken: AtomicBool,
    keys: Mutex<Vec<String>>,
}

impl ScriptedLimiter {
    pub fn denying() -> Self {
        let limiter = Self::default();
        limiter.deny.store(true, Ordering::SeqCst);
        limiter
    }

    pub fn broken() -> Self {
        let limiter = Self::default();
        limiter.broken.store(true, Ordering::SeqCst);
        limiter
    }

    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl RateLimiter for ScriptedLimiter {
    async fn rate_limit(&self, key: &str, _quantity: u32) -> Result<RateLimitResult, RateLimitError> {
        self.keys.lock().unwrap().push(key.to_string());
        if self.broken.load(Ordering::SeqCst) {
            return Err(RateLimitError::UnexpectedResponse("nil".to_string()));
        }

        let limited = self.deny.load(Ordering::SeqCst);
        Ok(RateLimitResult {
            limited,
            remaining: if limited { 0 } else { 1 },
            retry_after: limited.then(|| Duration::from_secs(1)),
            reset_after: Duration::from_secs(1),
        })
    }
}

/// Stats API answering with a fixed marker, or failing when none is set.
#[derive(Default)]
pub struct FakeStatsApi {
    marker: Mutex<Option<i64>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeStatsApi {
    pub fn returning(marker: i64) -> Self {
        Self {
            marker: Mutex::new(Some(marker)),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Answers with `marker` only after `delay`.
    pub fn stalling(marker: i64, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::returning(marker)
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn set_marker(&self, marker: i64) {
        *self.marker.lock().unwrap() = Some(marker);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatsApi for FakeStatsApi {
    async fn latest_replay(&self, _api_key: &str) -> Result<Replay, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let marker = *self.marker.lock().unwrap();
        match marker {
            Some(marker) => Ok(replay(marker)),
            None => Err(ApiError::Status {
                code: 503,
                message: "unavailable".to_string(),
            }),
        }
    }
}

/// Messenger recording destinations; some destinations can be made to fail.
#[derive(Default)]
pub struct RecordingMessenger {
    delivered: Mutex<Vec<(String, i64)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingMessenger {
    pub fn fail_for(&self, destination: &str) {
        self.failing.lock().unwrap().insert(destination.to_string());
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(destination, _)| destination.clone())
            .collect();
        destinations.sort();
        destinations
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn deliver(&self, destination: &str, embed: &Embed) -> Result<(), DeliveryError> {
        if self.failing.lock().unwrap().contains(destination) {
            return Err(DeliveryError::UnknownDestination(destination.to_string()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((destination.to_string(), i64::from(embed.color)));
        Ok(())
    }
}

pub fn replay(marker: i64) -> Replay {
    serde_json::from_value(serde_json::json!({
        "replay_id": marker,
        "replay_url": format!("https://example.test/replay/{}", marker),
        "map_name": "Alcyone LE",
        "format": "1v1",
        "game_type": "Ladder",
        "winning_player": "Alice",
        "seasons_id": 58,
        "replay_date": "2024-03-01 11:58:00",
        "replay_version": "5.0.12",
        "players": [
            {
                "players_id": 1, "clan": "AB", "race": "P", "mmr": 4100,
                "division": "Diamond", "server_rank": 3, "global_rank": 300,
                "apm": 170, "team": 1, "winner": 1, "color": "180,20,30"
            },
            {
                "players_id": 2, "clan": "", "race": "Z", "mmr": 4050,
                "division": "Diamond", "server_rank": 4, "global_rank": 310,
                "apm": 210, "team": 2, "winner": 0, "color": "0,66,255"
            }
        ]
    }))
    .unwrap()
}

pub fn settings() -> SchedulingSettings {
    SchedulingSettings {
        update_interval: UPDATE_INTERVAL,
        lock_ttl: LOCK_TTL,
        backoff: BackoffWindow::new(Duration::from_secs(5), Duration::from_secs(60)).unwrap(),
        max_attempts: 4,
    }
}

/// Every collaborator of a test context, kept concrete for assertions.
pub struct Harness {
    pub store: Arc<InMemoryAccountStore>,
    pub limiter: Arc<ScriptedLimiter>,
    pub api: Arc<FakeStatsApi>,
    pub messenger: Arc<RecordingMessenger>,
    pub enqueuer: Arc<RecordingEnqueuer>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(api: FakeStatsApi) -> Self {
        Self::with_parts(api, ScriptedLimiter::default(), RecordingEnqueuer::default())
    }

    pub fn with_parts(api: FakeStatsApi, limiter: ScriptedLimiter, enqueuer: RecordingEnqueuer) -> Self {
        Self {
            store: Arc::new(InMemoryAccountStore::new()),
            limiter: Arc::new(limiter),
            api: Arc::new(api),
            messenger: Arc::new(RecordingMessenger::default()),
            enqueuer: Arc::new(enqueuer),
            clock: Arc::new(ManualClock::new(start_time())),
        }
    }

    pub fn context(&self) -> JobContext {
        self.context_with_store(self.store.clone())
    }

    /// Context whose store is `store` instead of the harness store.
    pub fn context_with_store(&self, store: Arc<dyn AccountStore>) -> JobContext {
        JobContext::new(
            store,
            self.limiter.clone(),
            self.api.clone(),
            self.messenger.clone(),
            self.enqueuer.clone(),
            settings(),
        )
        .with_clock(self.clock.clone())
    }
}

/// Store whose `release_lock` waits before reaching the wrapped store.
pub struct SlowReleaseStore {
    inner: Arc<InMemoryAccountStore>,
    delay: Duration,
    releases_started: AtomicUsize,
}

impl SlowReleaseStore {
    pub fn new(inner: Arc<InMemoryAccountStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            releases_started: AtomicUsize::new(0),
        }
    }

    pub fn releases_started(&self) -> usize {
        self.releases_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for SlowReleaseStore {
    async fn get_account(&self, id: i64) -> Result<Option<TrackedAccount>, StoreError> {
        self.inner.get_account(id).await
    }

    async fn find_stale_accounts(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<TrackedAccount>, StoreError> {
        self.inner.find_stale_accounts(stale_before).await
    }

    async fn try_lock(
        &self,
        id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.try_lock(id, now, stale_before).await
    }

    async fn release_lock(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.releases_started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.release_lock(id, now).await
    }

    async fn update_marker(&self, id: i64, marker: i64) -> Result<(), StoreError> {
        self.inner.update_marker(id, marker).await
    }

    async fn reap_stale_locks(&self, locked_before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.reap_stale_locks(locked_before).await
    }

    async fn subscriptions_for(&self, account_id: i64) -> Result<Vec<Subscription>, StoreError> {
        self.inner.subscriptions_for(account_id).await
    }

    async fn link_account(
        &self,
        owner_ref: &str,
        api_key: &str,
    ) -> Result<TrackedAccount, StoreError> {
        self.inner.link_account(owner_ref, api_key).await
    }

    async fn subscribe(
        &self,
        account_id: i64,
        destination: &str,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe(account_id, destination).await
    }

    async fn unsubscribe(&self, account_id: i64, destination: &str) -> Result<bool, StoreError> {
        self.inner.unsubscribe(account_id, destination).await
    }
}
