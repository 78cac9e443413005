//! CLI command definitions for replay-watch.
//!
//! The `worker` command runs the scheduling loop; the remaining commands are
//! small admin operations against the same Postgres and Redis.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::jobs::{JobContext, JobRunner, SchedulingSettings};
use crate::metrics::{export_metrics, init_metrics};
use crate::notify::DiscordMessenger;
use crate::ratelimit::RedisRateLimiter;
use crate::replays::ReplayStatsClient;
use crate::scheduler::{
    connect_redis, Job, JobEnqueuer, JobKind, JobQueue, PeriodicEnqueuer, PeriodicJob,
    WorkerPool, WorkerPoolConfig,
};
use crate::storage::{AccountStore, PgAccountStore};

/// Replay watcher: polls tracked accounts and announces new replays.
#[derive(Parser)]
#[command(name = "replay-watch")]
#[command(about = "Poll a replay statistics API for tracked accounts and announce new replays")]
#[command(version)]
#[command(
    long_about = "replay-watch keeps a set of tracked accounts fresh: a periodic scan locks stale accounts and enqueues poll jobs, workers fetch each account's latest replay under a shared rate budget, and new replays are announced to every subscribed channel.\n\nConfiguration is read from the environment (DATABASE_URL, REDIS_URL, DISCORD_TOKEN, ...).\n\nExample usage:\n  replay-watch migrate\n  replay-watch account link --owner discord:1234 --api-key KEY\n  replay-watch worker"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker pool and the periodic scan/reap schedule.
    Worker(WorkerArgs),

    /// Apply database migrations.
    Migrate,

    /// Enqueue a single job by name.
    Enqueue(EnqueueArgs),

    /// Manage tracked accounts and their subscriptions.
    Account(AccountArgs),

    /// Print queue depths.
    #[command(name = "queue-stats")]
    QueueStats(QueueStatsArgs),
}

/// Arguments for `replay-watch worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers (overrides WORKER_CONCURRENCY).
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Apply migrations before starting.
    #[arg(long)]
    pub migrate: bool,
}

/// Arguments for `replay-watch enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Job name: poll-account, scan-stale or reap-locks.
    pub job: String,

    /// Account to poll (poll-account only).
    #[arg(long)]
    pub account_id: Option<i64>,

    /// Delay before the job becomes available.
    #[arg(long, default_value = "0")]
    pub delay_secs: u64,
}

/// Arguments for `replay-watch account`.
#[derive(Parser, Debug)]
pub struct AccountArgs {
    #[command(subcommand)]
    pub command: AccountSubcommand,
}

/// Account subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum AccountSubcommand {
    /// Link an owner to a replay API key (updates the key if already linked).
    Link {
        /// Owner reference, e.g. the chat user id.
        #[arg(long)]
        owner: String,

        /// Replay statistics API key.
        #[arg(long, env = "REPLAYS_ACCOUNT_API_KEY", hide_env_values = true)]
        api_key: String,
    },

    /// Subscribe a channel to an account's new replays.
    Subscribe {
        #[arg(long)]
        account_id: i64,

        /// Destination channel id.
        #[arg(long)]
        destination: String,
    },

    /// Remove a channel subscription.
    Unsubscribe {
        #[arg(long)]
        account_id: i64,

        /// Destination channel id.
        #[arg(long)]
        destination: String,
    },
}

/// Arguments for `replay-watch queue-stats`.
#[derive(Parser, Debug)]
pub struct QueueStatsArgs {
    /// Also print up to N dead-lettered jobs.
    #[arg(long, default_value = "0")]
    pub dead_letter: usize,

    /// Output JSON instead of plain text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::Enqueue(args) => run_enqueue_command(&config, args).await,
        Commands::Account(args) => run_account_command(&config, args).await,
        Commands::QueueStats(args) => run_queue_stats_command(&config, args).await,
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(mut config: Config, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
        config.validate()?;
    }

    init_metrics().context("Failed to register metrics")?;

    let store = connect_store(&config).await?;
    if args.migrate {
        let applied = store.run_migrations().await?;
        info!(applied = applied, "Migrations applied");
    }

    let redis = connect_redis(&config.redis_url).await?;
    let queue = Arc::new(JobQueue::from_connection(redis.clone(), &config.namespace));
    let enqueuer: Arc<dyn JobEnqueuer> = queue.clone();

    let limiter = RedisRateLimiter::new(redis.clone(), &config.namespace, config.rate_quota());
    let api = ReplayStatsClient::new(&config.api_base_url, config.api_timeout)?;
    let token = config
        .discord_token
        .clone()
        .context("DISCORD_TOKEN must be set to run the worker")?;
    let messenger = DiscordMessenger::new(&config.discord_api_base_url, token, config.api_timeout)?;

    let ctx = JobContext::new(
        Arc::new(store),
        Arc::new(limiter),
        Arc::new(api),
        Arc::new(messenger),
        Arc::clone(&enqueuer),
        SchedulingSettings::from_config(&config)?,
    );

    let pool_config = WorkerPoolConfig::new(config.concurrency)
        .with_poll_interval(config.poll_interval)
        .with_job_timeout(config.job_timeout)
        .with_shutdown_timeout(config.shutdown_timeout);
    let mut pool = WorkerPool::new(pool_config, queue, Arc::new(JobRunner::new(ctx)));

    let periodic_jobs = vec![
        PeriodicJob::new(JobKind::ScanStale, &config.scan_cron)
            .map_err(|e| anyhow::anyhow!("Invalid scan schedule: {}", e))?,
        PeriodicJob::new(JobKind::ReapLocks, &config.reap_cron)
            .map_err(|e| anyhow::anyhow!("Invalid reap schedule: {}", e))?,
    ];
    let periodic = PeriodicEnqueuer::new(redis, &config.namespace, periodic_jobs, enqueuer);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let periodic_handle = tokio::spawn(periodic.run(shutdown_rx));

    pool.start().await?;
    info!(
        workers = pool.num_workers(),
        namespace = %config.namespace,
        "replay-watch worker running"
    );

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    if let Err(e) = periodic_handle.await {
        warn!(error = %e, "Periodic enqueuer task failed");
    }
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        completed = stats.jobs_completed,
        retried = stats.jobs_retried,
        dead_lettered = stats.jobs_dead_lettered,
        timed_out = stats.jobs_timed_out,
        "Worker stopped"
    );
    debug!(metrics = %export_metrics(), "Final metrics");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ============================================================================
// Admin commands
// ============================================================================

async fn connect_store(config: &Config) -> anyhow::Result<PgAccountStore> {
    PgAccountStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to the account database")
}

async fn run_migrate_command(config: &Config) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let applied = store.run_migrations().await?;
    println!("Applied {} new migration(s)", applied);

    for migration in store.applied_migrations().await? {
        println!("  {} (applied {})", migration.name, migration.applied_at);
    }
    Ok(())
}

async fn run_enqueue_command(config: &Config, args: EnqueueArgs) -> anyhow::Result<()> {
    let kind = JobKind::from_name(&args.job, args.account_id).map_err(anyhow::Error::msg)?;
    let job = Job::new(kind).with_max_attempts(config.max_attempts);
    let job_id = job.id;

    let queue = JobQueue::connect(&config.redis_url, &config.namespace).await?;
    if args.delay_secs > 0 {
        queue
            .enqueue_after(job, Duration::from_secs(args.delay_secs))
            .await?;
        println!("Scheduled {} ({}) in {}s", kind, job_id, args.delay_secs);
    } else {
        queue.enqueue_now(job).await?;
        println!("Enqueued {} ({})", kind, job_id);
    }
    Ok(())
}

async fn run_account_command(config: &Config, args: AccountArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;

    match args.command {
        AccountSubcommand::Link { owner, api_key } => {
            let account = store.link_account(&owner, &api_key).await?;
            println!("Linked {} as account {}", account.owner_ref, account.id);
        }
        AccountSubcommand::Subscribe {
            account_id,
            destination,
        } => {
            let subscription = store.subscribe(account_id, &destination).await?;
            println!(
                "Channel {} subscribed to account {} (subscription {})",
                subscription.destination, subscription.account_id, subscription.id
            );
        }
        AccountSubcommand::Unsubscribe {
            account_id,
            destination,
        } => {
            if store.unsubscribe(account_id, &destination).await? {
                println!("Channel {} unsubscribed from account {}", destination, account_id);
            } else {
                println!("Channel {} was not subscribed to account {}", destination, account_id);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct QueueStatsOutput {
    #[serde(flatten)]
    stats: crate::scheduler::QueueStats,
    total_jobs: usize,
    dead_letter_sample: Vec<serde_json::Value>,
}

async fn run_queue_stats_command(config: &Config, args: QueueStatsArgs) -> anyhow::Result<()> {
    let queue = JobQueue::connect(&config.redis_url, &config.namespace).await?;
    let stats = queue.stats().await?;
    let dead_letter_sample = queue.peek_dead_letter(args.dead_letter).await?;

    if args.json {
        let output = QueueStatsOutput {
            total_jobs: stats.total_jobs(),
            stats,
            dead_letter_sample,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Queue namespace: {}", stats.namespace);
    println!("  pending:     {}", stats.pending_jobs);
    println!("  processing:  {}", stats.processing_jobs);
    println!("  scheduled:   {}", stats.scheduled_jobs);
    println!("  dead letter: {}", stats.dead_letter_jobs);
    for entry in dead_letter_sample {
        println!("  - {}", entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_worker_defaults() {
        let cli = Cli::try_parse_from(["replay-watch", "worker"]).expect("should parse");
        match cli.command {
            Commands::Worker(args) => {
                assert!(args.concurrency.is_none());
                assert!(!args.migrate);
            }
            _ => panic!("Expected Worker command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_enqueue_poll_account() {
        let cli = Cli::try_parse_from([
            "replay-watch",
            "enqueue",
            "poll-account",
            "--account-id",
            "12",
            "--delay-secs",
            "30",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.job, "poll-account");
                assert_eq!(args.account_id, Some(12));
                assert_eq!(args.delay_secs, 30);
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_account_subscribe() {
        let cli = Cli::try_parse_from([
            "replay-watch",
            "-l",
            "debug",
            "account",
            "subscribe",
            "--account-id",
            "3",
            "--destination",
            "998877",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Account(AccountArgs {
                command:
                    AccountSubcommand::Subscribe {
                        account_id,
                        destination,
                    },
            }) => {
                assert_eq!(account_id, 3);
                assert_eq!(destination, "998877");
            }
            _ => panic!("Expected account subscribe"),
        }
    }

    #[test]
    fn test_queue_stats_flags() {
        let cli = Cli::try_parse_from(["replay-watch", "queue-stats", "--dead-letter", "5", "-j"])
            .expect("should parse");
        match cli.command {
            Commands::QueueStats(args) => {
                assert_eq!(args.dead_letter, 5);
                assert!(args.json);
            }
            _ => panic!("Expected QueueStats command"),
        }
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["replay-watch", "generate"]).is_err());
    }
}
