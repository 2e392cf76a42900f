//! Sweep benchmarking for a managed vector-database cluster.
//!
//! Drives a parameter grid against an already running cluster: apply a
//! tuning record over the control-plane APIs, wait for the rollout, reset the
//! dataset, run an external load generator for every search setting and keep
//! its raw output plus a summary.
//!
//! # Architecture
//!
//! ```text
//! bench
//! ├── client/       # Collection and cluster-lifecycle REST clients
//! ├── applier       # Apply-and-verify with bounded retries
//! ├── grid          # Sweep dimensions and cell enumeration
//! ├── runner/       # Grid driver, data loader, load generator
//! ├── metrics/      # Cell summaries and the on-disk result store
//! └── telemetry     # Periodic endpoint and host statistics capture
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use sweep_bench::{GridDriver, SweepConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SweepConfig::load(Some("sweep.yaml"))?;
//!     let driver = GridDriver::new(config, std::path::Path::new("results/run-1"))?;
//!     let report = driver.run().await?;
//!     println!("{} of {} cells succeeded", report.succeeded, report.total);
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod client;
pub mod config;
pub mod grid;
pub mod logging;
pub mod metrics;
pub mod poll;
pub mod runner;
pub mod telemetry;
pub mod tuning;

pub use applier::{ApplierSettings, ApplyError, TuningApplier};
pub use client::{ApiError, ClusterApi, ClusterClient, CollectionApi, CollectionClient};
pub use config::SweepConfig;
pub use grid::{GridCell, GridConfig, SearchParams};
pub use metrics::{BenchSummary, CellOutcome, CellRecord, ResultStore};
pub use poll::{PollError, Poller};
pub use runner::{GridDriver, RunReport};
pub use telemetry::TelemetryCollector;
pub use tuning::{Knob, TuningRecord};
