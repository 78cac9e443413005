//! Command-line interface for replay-watch.
//!
//! Provides the worker process and admin commands for accounts,
//! subscriptions, migrations and the job queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
