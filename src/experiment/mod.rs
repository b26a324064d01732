//! Experiment Data Model
//!
//! Scenarios, runs and their outcome records.
//!
//! ## Schema Overview
//!
//! ```text
//! ScenarioGrid (1) ──< ScenarioSpec (N) ──< RunRecord (repetitions)
//!                                               │
//!                                               ├──< AttemptRecord (≤ retry budget + 1)
//!                                               └──  RunMetrics (0..1, only when succeeded)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use gemelo::experiment::{RunRecord, RunState, RunTransition, ScenarioGrid};
//!
//! let grid = ScenarioGrid::builder()
//!     .complexities([1, 2])
//!     .noise_levels([0.0, 0.5])
//!     .build()
//!     .unwrap();
//!
//! let plan = &grid.runs()[0];
//! let mut run = RunRecord::new(plan.run_id(), plan.scenario().id(), plan.repetition());
//! run.apply(RunTransition::Start).unwrap();
//! run.apply(RunTransition::Succeed { sample_count: 100 }).unwrap();
//! assert_eq!(run.state(), RunState::Succeeded);
//! ```

mod metric_record;
mod run_record;
mod scenario;

pub use metric_record::{RunMetrics, RunMetricsBuilder};
pub use run_record::{AttemptRecord, RunRecord, RunState, RunTransition};
pub use scenario::{PartialDataPolicy, RunPlan, ScenarioGrid, ScenarioGridBuilder, ScenarioSpec};
