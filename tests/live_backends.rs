//! Integration tests against real Postgres and Redis.
//!
//! Run with: DATABASE_URL=postgres://... REDIS_URL=redis://... cargo test --test live_backends -- --ignored

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use replay_watch::ratelimit::{RateLimiter, RateQuota, RedisRateLimiter};
use replay_watch::scheduler::{connect_redis, Job, JobEnqueuer, JobKind, JobQueue};
use replay_watch::storage::{AccountStore, PgAccountStore};

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for live tests")
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test live_backends -- --ignored
async fn test_postgres_lock_lifecycle() {
    let store = PgAccountStore::connect(&database_url(), 4).await.unwrap();
    store.run_migrations().await.unwrap();
    assert_eq!(store.run_migrations().await.unwrap(), 0);
    assert!(store.applied_migrations().await.unwrap().len() >= 5);

    let account = store.link_account(&unique("owner"), "key").await.unwrap();
    store.subscribe(account.id, "chan-1").await.unwrap();
    store.subscribe(account.id, "chan-1").await.unwrap();
    assert_eq!(store.subscriptions_for(account.id).await.unwrap().len(), 1);

    let now = Utc::now();
    let stale_before = now - chrono::Duration::seconds(300);
    assert!(store.try_lock(account.id, now, stale_before).await.unwrap());
    assert!(!store.try_lock(account.id, now, stale_before).await.unwrap());

    store.update_marker(account.id, 77).await.unwrap();
    store.release_lock(account.id, now).await.unwrap();

    let reloaded = store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(reloaded.last_seen_marker, Some(77));
    assert!(reloaded.locked_at.is_none());
    // Just checked, so not stale for the same cutoff.
    assert!(!store.try_lock(account.id, now, stale_before).await.unwrap());

    assert!(store.unsubscribe(account.id, "chan-1").await.unwrap());
}

#[tokio::test]
#[ignore] // Run with: cargo test --test live_backends -- --ignored
async fn test_redis_queue_round_trip() {
    let namespace = unique("replay-watch-test");
    let queue = JobQueue::connect(&redis_url(), &namespace).await.unwrap();
    queue.heartbeat().await.unwrap();

    queue.enqueue_now(Job::poll_account(5)).await.unwrap();
    queue
        .enqueue_after(Job::new(JobKind::ScanStale), Duration::from_secs(3600))
        .await
        .unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending_jobs, 1);
    assert_eq!(stats.scheduled_jobs, 1);

    let leased = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(leased.job.kind, JobKind::PollAccount { account_id: 5 });
    queue.complete(&leased).await.unwrap();

    assert_eq!(queue.promote_due().await.unwrap(), 0);
    assert_eq!(queue.stats().await.unwrap().processing_jobs, 0);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test live_backends -- --ignored
async fn test_recovery_leaves_live_consumers_alone() {
    let namespace = unique("replay-watch-test");
    let first = JobQueue::connect(&redis_url(), &namespace).await.unwrap();
    let second = JobQueue::connect(&redis_url(), &namespace).await.unwrap();
    first.heartbeat().await.unwrap();
    second.heartbeat().await.unwrap();

    first.enqueue_now(Job::poll_account(9)).await.unwrap();
    let in_flight = first.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();

    // A second process starting up must not touch a live consumer's jobs.
    assert_eq!(second.recover_processing_jobs().await.unwrap(), 0);
    let stats = second.stats().await.unwrap();
    assert_eq!(stats.pending_jobs, 0);
    assert_eq!(stats.processing_jobs, 1);

    // Once the first process is gone its job comes back with one failed attempt.
    first.retire().await.unwrap();
    assert_eq!(second.recover_processing_jobs().await.unwrap(), 1);
    assert_eq!(second.recover_processing_jobs().await.unwrap(), 0);

    let requeued = second.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(requeued.job.id, in_flight.job.id);
    assert_eq!(requeued.job.attempts, 1);
    second.complete(&requeued).await.unwrap();
    assert_eq!(second.stats().await.unwrap().processing_jobs, 0);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test live_backends -- --ignored
async fn test_redis_limiter_shares_budget() {
    let namespace = unique("replay-watch-test");
    let redis = connect_redis(&redis_url()).await.unwrap();
    let quota = RateQuota::per_second(0.1, 1);
    let first = Arc::new(RedisRateLimiter::new(redis.clone(), &namespace, quota));
    let second = Arc::new(RedisRateLimiter::new(redis, &namespace, quota));

    assert!(!first.rate_limit("poll-account", 1).await.unwrap().limited);
    assert!(!second.rate_limit("poll-account", 1).await.unwrap().limited);

    let denied = first.rate_limit("poll-account", 1).await.unwrap();
    assert!(denied.limited);
    assert!(denied.retry_after.is_some());
}
