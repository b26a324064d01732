//! # Gemelo: Digital-Twin Experiment Orchestration
//!
//! **Version**: 0.1.0
//!
//! Gemelo sequences repeated simulation runs over a grid of experimental
//! conditions, fuses robot telemetry with virtualized enterprise data, fits
//! and serves a world model under explicit deadlines, and records accuracy
//! and latency metrics per run.
//!
//! ## Components (leaf-first)
//!
//! - [`gateway`]: bounded-latency lookups over any keyed row source
//! - [`telemetry`]: paced, cancellable sample streams per run
//! - [`registry`]: run lifecycle store with atomic transitions
//! - [`model`]: world model service enforcing `fit`/`predict` deadlines
//! - [`metrics`]: append-only result set and Parquet export
//! - [`pipeline`]: the body of one run
//! - [`orchestrator`]: scheduling, retries, cancellation and the batch report
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: a run that misses a deadline fails loudly, never with a
//!   stale prediction
//! - **Poka-Yoke**: the run state machine rejects every transition out of a
//!   terminal state
//! - **Heijunka**: a fixed worker limit levels load across the batch
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use gemelo::batch::run_experiment_batch;
//! use gemelo::config::ExperimentConfig;
//! use gemelo::experiment::ScenarioGrid;
//!
//! # async fn example() -> gemelo::Result<()> {
//! gemelo::observability::init_tracing();
//!
//! let grid = ScenarioGrid::builder()
//!     .complexities([1, 2])
//!     .noise_levels([0.0, 0.5])
//!     .build()?;
//! let report = run_experiment_batch(&grid, &ExperimentConfig::from_env()?).await?;
//!
//! for metrics in report.metrics() {
//!     println!("{}: rmse={:.3}", metrics.run_id(), metrics.rmse());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod batch;
pub mod cancel;
pub mod config;
pub mod error;
pub mod experiment;
pub mod fusion;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod telemetry;

pub use error::{Error, ErrorKind, Result};
