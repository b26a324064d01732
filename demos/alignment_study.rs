//! Alignment Study Example
//!
//! Runs the default design space (noise {0.5, 1.0} x complexity {1, 2})
//! through the reference pipeline, streams terminal runs as they finish and
//! exports the result set to Parquet.
//!
//! Configuration comes from `GEMELO_CONFIG` (a JSON file) when set, then
//! from `GEMELO_*` overrides.
//!
//! Run with: cargo run --example alignment_study

use anyhow::Context;
use gemelo::batch::default_orchestrator;
use gemelo::config::ExperimentConfig;
use gemelo::experiment::ScenarioGrid;
use gemelo::metrics::ParquetResultSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gemelo::observability::init_tracing();

    let config = match std::env::var("GEMELO_CONFIG") {
        Ok(path) => ExperimentConfig::from_json_file(&path)
            .with_context(|| format!("loading {path}"))?
            .with_env_overrides()?,
        Err(_) => ExperimentConfig::from_env()?,
    };

    println!("=== Gemelo Alignment Study ===\n");
    let grid = ScenarioGrid::builder()
        .complexities([1, 2])
        .noise_levels([0.5, 1.0])
        .repetitions(3)
        .build()?;
    println!(
        "{} scenarios, {} runs, worker limit {}, retry budget {}\n",
        grid.len(),
        grid.run_count(),
        config.orchestrator.worker_limit,
        config.orchestrator.retry_budget
    );

    let orchestrator = default_orchestrator(&grid, &config)?;
    let mut events = orchestrator.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!(
                "   {:<28} {:<10} attempts={}",
                event.run_id, event.state, event.attempts
            );
        }
    });

    let report = orchestrator.run_batch(&grid).await?;
    drop(orchestrator);
    progress.await?;

    println!("\nPer-scenario summary:");
    for (scenario, summary) in report.scenarios() {
        let rmse: Vec<f64> = report
            .metrics()
            .iter()
            .filter(|m| m.scenario_id() == scenario)
            .map(|m| m.rmse())
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let mean_rmse = if rmse.is_empty() {
            f64::NAN
        } else {
            rmse.iter().sum::<f64>() / rmse.len() as f64
        };
        println!(
            "   {scenario}: {}/{} succeeded, mean rmse {mean_rmse:.3}, sla violations {}",
            summary.succeeded, summary.runs, summary.sla_violations
        );
    }

    for failure in report.failures() {
        println!("   FAILED {} ({}): {}", failure.run_id, failure.error_kind, failure.detail);
    }

    let path = std::env::temp_dir().join("gemelo_alignment_study.parquet");
    let rows = ParquetResultSink::new(&path).write(report.metrics())?;
    println!("\nWrote {rows} rows to {}", path.display());
    Ok(())
}
