//! Batch entry point
//!
//! Wires the reference collaborators into one runnable experiment: the
//! synthetic simulator, a columnar enterprise table covering every scenario
//! of the grid, the OLS world model, an in-memory registry and a fresh
//! result set.
//!
//! ```rust,no_run
//! use gemelo::batch::run_experiment_batch;
//! use gemelo::config::ExperimentConfig;
//! use gemelo::experiment::ScenarioGrid;
//!
//! # async fn example() -> gemelo::Result<()> {
//! let report = run_experiment_batch(&ScenarioGrid::study_default(), &ExperimentConfig::default()).await?;
//! for (scenario, summary) in report.scenarios() {
//!     println!("{scenario}: {}/{} succeeded", summary.succeeded, summary.runs);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::ExperimentConfig;
use crate::experiment::ScenarioGrid;
use crate::gateway::ColumnarSource;
use crate::metrics::MetricsAggregator;
use crate::model::LinearWorldModel;
use crate::orchestrator::{BatchReport, Orchestrator};
use crate::pipeline::Pipeline;
use crate::registry::MemoryRunRegistry;
use crate::telemetry::SyntheticSimulator;
use crate::Result;

/// Executor built by [`default_orchestrator`].
pub type DefaultPipeline = Pipeline<ColumnarSource, SyntheticSimulator, LinearWorldModel>;

/// Build the reference orchestrator for `grid` without running it, so the
/// caller can `subscribe()` or keep a handle for cancellation first.
///
/// # Errors
///
/// Returns `Config` for an inconsistent configuration and `Arrow` if the
/// enterprise table cannot be built.
pub fn default_orchestrator(
    grid: &ScenarioGrid,
    config: &ExperimentConfig,
) -> Result<Orchestrator<DefaultPipeline, MemoryRunRegistry>> {
    config.validate()?;

    let scenario_ids: Vec<String> = grid.scenarios().iter().map(|s| s.id()).collect();
    let table = ColumnarSource::synthetic_enterprise(
        config.gateway.table.clone(),
        scenario_ids.iter().map(String::as_str),
        config.sampling.buckets_per_run(),
        config.model.seed,
    )?;

    let pipeline = Pipeline::new(
        SyntheticSimulator::new(config.model.seed),
        table,
        LinearWorldModel::new(),
        config,
    );
    Ok(Orchestrator::new(
        pipeline,
        Arc::new(MemoryRunRegistry::new()),
        Arc::new(MetricsAggregator::new()),
        config.orchestrator.clone(),
    ))
}

/// Run every run of `grid` with the reference pipeline and return the
/// batch report (terminal runs, metrics and per-scenario summaries).
///
/// # Errors
///
/// Returns `Config` for an inconsistent configuration. Individual run
/// failures never fail the batch; they are listed in the report.
pub async fn run_experiment_batch(grid: &ScenarioGrid, config: &ExperimentConfig) -> Result<BatchReport> {
    info!(
        scenarios = grid.len(),
        runs = grid.run_count(),
        rate_hz = config.sampling.rate_hz,
        duration_ms = config.sampling.duration_ms,
        "running experiment batch"
    );
    default_orchestrator(grid, config)?.run_batch(grid).await
}
