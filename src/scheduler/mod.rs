//! Job scheduling on top of Redis.
//!
//! This module provides infrastructure for distributed job execution:
//!
//! - **JobQueue**: Redis-based job queue with reliable dequeue using BRPOPLPUSH
//!   and a sorted set for delayed jobs
//! - **WorkerPool**: Pool of workers that run jobs concurrently through a [`JobHandler`]
//! - **PeriodicEnqueuer**: cron-driven enqueue of the scan and reap jobs
//! - **Job**: Job definitions with retry bookkeeping
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐   ┌──────────────┐
//!   │   Periodic   │   │  Scanner /   │
//!   │   enqueuer   │   │  Admin CLI   │
//!   └──────┬───────┘   └──────┬───────┘
//!          │                  │
//!          └────────┬─────────┘
//!            ┌──────▼───────┐   due    ┌──────────────┐
//!            │    Redis     │◄─────────│  Scheduled   │
//!            │    Queue     │          │  (delayed)   │
//!            └──────┬───────┘          └──────────────┘
//!                   │
//!       ┌───────────┼───────────┐
//!       ▼           ▼           ▼
//!  ┌─────────┐ ┌─────────┐ ┌─────────┐
//!  │ Worker 1│ │ Worker 2│ │ Worker N│
//!  └─────────┘ └─────────┘ └─────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: Uses BRPOPLPUSH to atomically move jobs to processing queue
//! - **Crash recovery**: Jobs in processing queue are requeued on worker restart
//! - **Dead letter queue**: Permanent failures and jobs out of attempts are parked for analysis
//! - **Graceful shutdown**: Workers finish current jobs before stopping

pub mod backoff;
pub mod job;
pub mod periodic;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use backoff::{retry_backoff, BackoffWindow};
pub use job::{Job, JobKind, POLL_ACCOUNT, REAP_LOCKS, SCAN_STALE};
pub use periodic::{latest_due, PeriodicEnqueuer, PeriodicJob};
pub use queue::{
    connect_redis, JobEnqueuer, JobQueue, LeasedJob, QueueError, QueueKeys, QueueStats,
    HEARTBEAT_TTL,
};
pub use worker_pool::{JobHandler, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
