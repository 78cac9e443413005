//! Redis-based job queue with reliable dequeue and delayed jobs.
//!
//! # Queue Structure
//!
//! All keys live under `{namespace}:jobs`:
//!
//! - `{namespace}:jobs`: main list where ready jobs are enqueued
//! - `{namespace}:jobs:processing:{queue_id}`: jobs leased by one process
//! - `{namespace}:jobs:heartbeat:{queue_id}`: expiring key, present while that process lives
//! - `{namespace}:jobs:consumers`: set of every `queue_id` that ever leased jobs
//! - `{namespace}:jobs:scheduled`: sorted set of delayed jobs, scored by due time (ms)
//! - `{namespace}:jobs:dead_letter`: jobs that failed permanently or after max attempts
//!
//! # Reliability
//!
//! Jobs are atomically moved from the main list to the caller's own
//! processing list when dequeued. Only lists whose heartbeat has expired are
//! recovered, so a live process never has its in-flight jobs requeued.
//! Delivery is at least once: a job recovered after a crash may run twice.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::job::Job;

/// Maximum number of delayed jobs promoted per call.
const PROMOTE_BATCH: usize = 100;

/// Moves due members of the scheduled set onto the main list.
///
/// KEYS[1] = scheduled set, KEYS[2] = main list; ARGV[1] = now (ms), ARGV[2] = batch.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, payload in ipairs(due) do
  redis.call('ZREM', KEYS[1], payload)
  redis.call('LPUSH', KEYS[2], payload)
end
return #due
"#;

/// How long a consumer's heartbeat outlives its last refresh.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(30);

/// Moves every job of a consumer whose heartbeat expired onto the caller's
/// processing list and forgets that consumer.
///
/// KEYS[1] = consumer set, KEYS[2] = dead heartbeat, KEYS[3] = dead processing
/// list, KEYS[4] = own processing list; ARGV[1] = dead queue id.
/// Returns the moved payloads, or nothing while the heartbeat is alive.
const RECLAIM_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return {}
end
local moved = {}
while true do
  local payload = redis.call('RPOPLPUSH', KEYS[3], KEYS[4])
  if not payload then break end
  table.insert(moved, payload)
end
redis.call('SREM', KEYS[1], ARGV[1])
return moved
"#;

/// Redis key layout of one queue consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub queue_id: String,
    pub main: String,
    pub scheduled: String,
    pub dead_letter: String,
    pub consumers: String,
    pub processing: String,
    pub heartbeat: String,
    base: String,
}

impl QueueKeys {
    pub fn new(namespace: &str, queue_id: &str) -> Self {
        let base = format!("{}:jobs", namespace);
        Self {
            queue_id: queue_id.to_string(),
            main: base.clone(),
            scheduled: format!("{}:scheduled", base),
            dead_letter: format!("{}:dead_letter", base),
            consumers: format!("{}:consumers", base),
            processing: format!("{}:processing:{}", base, queue_id),
            heartbeat: format!("{}:heartbeat:{}", base, queue_id),
            base,
        }
    }

    /// Processing list of another consumer.
    pub fn processing_of(&self, queue_id: &str) -> String {
        format!("{}:processing:{}", self.base, queue_id)
    }

    /// Heartbeat key of another consumer.
    pub fn heartbeat_of(&self, queue_id: &str) -> String {
        format!("{}:heartbeat:{}", self.base, queue_id)
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Producer side of the job queue.
///
/// The scanner and the poll executor depend on this trait rather than on
/// Redis so they can be exercised against an in-memory queue.
#[async_trait]
pub trait JobEnqueuer: Send + Sync {
    /// Makes `job` available to workers immediately.
    async fn enqueue_now(&self, job: Job) -> Result<(), QueueError>;

    /// Makes `job` available to workers once `delay` has elapsed.
    async fn enqueue_after(&self, job: Job, delay: Duration) -> Result<(), QueueError>;
}

/// A job taken off the queue together with its exact stored payload.
///
/// The payload is what `LREM` needs to remove the entry from the processing
/// list, so it is kept verbatim instead of being re-serialized.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The decoded job.
    pub job: Job,
    payload: String,
}

/// Redis-based job queue with reliable dequeue.
///
/// Every `JobQueue` value is its own consumer with a fresh `queue_id`; clones
/// share it.
#[derive(Clone)]
pub struct JobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    namespace: String,
    keys: QueueKeys,
    promote: redis::Script,
    reclaim: redis::Script,
}

impl JobQueue {
    /// Connects to Redis and creates a new job queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, QueueError> {
        let redis = connect_redis(redis_url).await?;
        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a JobQueue from an existing ConnectionManager.
    ///
    /// The rate limiter and periodic enqueuer share the same connection.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            keys: QueueKeys::new(namespace, &Uuid::new_v4().to_string()),
            promote: redis::Script::new(PROMOTE_SCRIPT),
            reclaim: redis::Script::new(RECLAIM_SCRIPT),
        }
    }

    /// Marks this consumer alive for another [`HEARTBEAT_TTL`].
    ///
    /// Must run before the first dequeue and at least once per TTL while
    /// jobs are leased.
    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(&self.keys.consumers, &self.keys.queue_id)
            .set_ex(
                &self.keys.heartbeat,
                Utc::now().timestamp_millis(),
                HEARTBEAT_TTL.as_secs(),
            );
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Drops the heartbeat so jobs left behind are recovered at once.
    pub async fn retire(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.keys.heartbeat).await?;
        Ok(())
    }

    /// Dequeues the next job, blocking until one is available or timeout.
    ///
    /// Uses BRPOPLPUSH to atomically move the job from the main list to the
    /// processing list.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(job))` if a job was dequeued
    /// - `Ok(None)` if the timeout expired with no jobs available
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.keys.main)
            .arg(&self.keys.processing)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(payload) = result else {
            return Ok(None);
        };

        match serde_json::from_str::<Job>(&payload) {
            Ok(job) => Ok(Some(LeasedJob { job, payload })),
            Err(e) => {
                self.park_undecodable(&payload, &e).await?;
                Ok(None)
            }
        }
    }

    /// Undecodable entries would be recovered forever; park them.
    async fn park_undecodable(&self, payload: &str, e: &serde_json::Error) -> Result<(), QueueError> {
        warn!(error = %e, "Moving undecodable job payload to dead letter queue");
        let entry = serde_json::json!({
            "payload": payload,
            "error": e.to_string(),
            "moved_at": Utc::now().to_rfc3339(),
        });
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.keys.processing, 1, payload)
            .lpush(&self.keys.dead_letter, serde_json::to_string(&entry)?);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Removes a finished job from the processing list.
    pub async fn complete(&self, leased: &LeasedJob) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(&self.keys.processing, 1, &leased.payload)
            .await?;
        Ok(())
    }

    /// Replaces a leased job with `job`, due after `delay`.
    ///
    /// Used for retries; `job` carries the updated attempt counter.
    pub async fn retry_after(
        &self,
        leased: &LeasedJob,
        job: &Job,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.keys.processing, 1, &leased.payload)
            .zadd(&self.keys.scheduled, serialized, due_at_millis(delay));
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Moves a leased job to the dead letter queue.
    pub async fn dead_letter(
        &self,
        leased: &LeasedJob,
        job: &Job,
        error: &str,
    ) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.keys.processing, 1, &leased.payload)
            .lpush(&self.keys.dead_letter, serialized);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Moves delayed jobs whose due time has passed onto the main list.
    ///
    /// Returns the number of jobs promoted. Safe to call from many workers
    /// at once; the script runs atomically.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let promoted: usize = self
            .promote
            .key(&self.keys.scheduled)
            .key(&self.keys.main)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    /// Recovers jobs leased by consumers whose heartbeat expired.
    ///
    /// Each recovered job counts as a failed attempt; jobs out of attempts go
    /// to the dead letter queue. Consumers still alive are left alone, and a
    /// dead consumer is claimed atomically so two callers never requeue the
    /// same job.
    ///
    /// # Returns
    ///
    /// The number of jobs requeued.
    pub async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let consumers: Vec<String> = conn.smembers(&self.keys.consumers).await?;
        let mut recovered = 0;

        for queue_id in consumers {
            if queue_id == self.keys.queue_id {
                continue;
            }
            let payloads: Vec<String> = self
                .reclaim
                .key(&self.keys.consumers)
                .key(self.keys.heartbeat_of(&queue_id))
                .key(self.keys.processing_of(&queue_id))
                .key(&self.keys.processing)
                .arg(&queue_id)
                .invoke_async(&mut conn)
                .await?;
            if payloads.is_empty() {
                continue;
            }

            info!(
                consumer = %queue_id,
                jobs = payloads.len(),
                "Reclaiming jobs of expired consumer"
            );
            for payload in payloads {
                if self.requeue_reclaimed(payload).await? {
                    recovered += 1;
                }
            }
        }

        Ok(recovered)
    }

    /// Puts a reclaimed job back on the main list, or dead-letters it.
    ///
    /// Returns whether the job was requeued.
    async fn requeue_reclaimed(&self, payload: String) -> Result<bool, QueueError> {
        let mut job = match serde_json::from_str::<Job>(&payload) {
            Ok(job) => job,
            Err(e) => {
                self.park_undecodable(&payload, &e).await?;
                return Ok(false);
            }
        };
        job.record_failure("worker exited before completing the job");
        let leased = LeasedJob { job, payload };

        if !leased.job.should_retry() {
            self.dead_letter(
                &leased,
                &leased.job,
                "Recovered from processing queue after max attempts",
            )
            .await?;
            return Ok(false);
        }

        let serialized = serde_json::to_string(&leased.job)?;
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.keys.processing, 1, &leased.payload)
            .rpush(&self.keys.main, &serialized);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(true)
    }

    /// Returns queue statistics.
    ///
    /// `processing_jobs` sums the processing lists of every known consumer.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();

        let (pending, scheduled, dead_letter, consumers): (usize, usize, usize, Vec<String>) =
            redis::pipe()
                .llen(&self.keys.main)
                .zcard(&self.keys.scheduled)
                .llen(&self.keys.dead_letter)
                .smembers(&self.keys.consumers)
                .query_async(&mut conn)
                .await?;

        let mut lengths = redis::pipe();
        for queue_id in &consumers {
            lengths.llen(self.keys.processing_of(queue_id));
        }
        let processing: Vec<usize> = if consumers.is_empty() {
            Vec::new()
        } else {
            lengths.query_async(&mut conn).await?
        };

        Ok(QueueStats {
            namespace: self.namespace.clone(),
            pending_jobs: pending,
            processing_jobs: processing.iter().sum(),
            scheduled_jobs: scheduled,
            dead_letter_jobs: dead_letter,
        })
    }

    /// Peeks at jobs in the dead letter queue without removing them.
    pub async fn peek_dead_letter(
        &self,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.keys.dead_letter, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    /// Returns the namespace of the queue.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the key layout of this consumer.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}

#[async_trait]
impl JobEnqueuer for JobQueue {
    async fn enqueue_now(&self, job: Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.keys.main, serialized).await?;
        Ok(())
    }

    async fn enqueue_after(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(&self.keys.scheduled, serialized, due_at_millis(delay))
            .await?;
        Ok(())
    }
}

/// Opens a managed Redis connection.
pub async fn connect_redis(redis_url: &str) -> Result<ConnectionManager, QueueError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
}

fn due_at_millis(delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(delay_ms)
}

/// Statistics about queue state.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Namespace of the queue.
    pub namespace: String,
    /// Number of jobs ready to be processed.
    pub pending_jobs: usize,
    /// Number of jobs currently being processed.
    pub processing_jobs: usize,
    /// Number of delayed jobs not yet due.
    pub scheduled_jobs: usize,
    /// Number of jobs in the dead letter queue.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of jobs in all queues.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.scheduled_jobs + self.dead_letter_jobs
    }
}
