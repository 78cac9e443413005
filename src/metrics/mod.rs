//! Metrics module for Prometheus-based monitoring.
//!
//! Covers job processing, queue depth, poll outcomes, notification delivery
//! and lock churn.
//!
//! # Example
//!
//! ```ignore
//! use replay_watch::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_poll("changed");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
