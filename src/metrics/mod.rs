//! Metrics Aggregator
//!
//! Append-only result set of the experiment: one [`RunMetrics`] per
//! successful run, never overwritten. Reads per scenario return records in
//! the order runs completed, not the order they were scheduled.

mod sink;

pub use sink::ParquetResultSink;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::info;
use trueno::Vector;

use crate::experiment::{RunMetrics, RunRecord, RunState};
use crate::pipeline::RunOutcome;
use crate::{Error, Result};

/// Residuals per SIMD reduction; chunk sums are accumulated in `f64`.
const REDUCTION_CHUNK: usize = 4096;

/// Root mean squared error between predictions and ground truth.
///
/// Residuals are taken in `f64`, scaled by the largest absolute residual and
/// reduced chunk-wise in `f32` SIMD lanes with the chunk sums carried in
/// `f64`. The result keeps single-precision relative accuracy (about `1e-7`)
/// over the full `f64` range: tiny residuals do not underflow and large ones
/// do not overflow.
///
/// # Errors
///
/// Returns `InvalidInput` for empty, mismatched or non-finite inputs.
pub fn rmse(predicted: &[f64], actual: &[f64]) -> Result<f64> {
    let (scale, errors) = scaled_residuals(predicted, actual)?;
    let mut squared = 0.0f64;
    for chunk in errors.chunks(REDUCTION_CHUNK) {
        let lanes = Vector::from_slice(chunk);
        let partial = lanes
            .dot(&lanes)
            .map_err(|e| Error::Other(format!("SIMD dot product failed: {e}")))?;
        squared += f64::from(partial);
    }
    Ok(scale * (squared / len_f64(predicted)).sqrt())
}

/// Mean absolute error between predictions and ground truth.
///
/// Same scaled, chunked reduction as [`rmse`].
///
/// # Errors
///
/// Returns `InvalidInput` for empty, mismatched or non-finite inputs.
pub fn mae(predicted: &[f64], actual: &[f64]) -> Result<f64> {
    let (scale, errors) = scaled_residuals(predicted, actual)?;
    let mut total = 0.0f64;
    for chunk in errors.chunks(REDUCTION_CHUNK) {
        let absolute: Vec<f32> = chunk.iter().map(|e| e.abs()).collect();
        let partial = Vector::from_slice(&absolute)
            .sum_kahan()
            .map_err(|e| Error::Other(format!("SIMD sum failed: {e}")))?;
        total += f64::from(partial);
    }
    Ok(scale * total / len_f64(predicted))
}

/// Residuals divided by the largest absolute residual, so every lane lies in
/// `[-1, 1]`. Returns the scale alongside.
#[allow(clippy::cast_possible_truncation)]
fn scaled_residuals(predicted: &[f64], actual: &[f64]) -> Result<(f64, Vec<f32>)> {
    if predicted.is_empty() {
        return Err(Error::InvalidInput("no predictions to score".to_string()));
    }
    if predicted.len() != actual.len() {
        return Err(Error::InvalidInput(format!(
            "{} predictions for {} ground-truth values",
            predicted.len(),
            actual.len()
        )));
    }

    let residuals: Vec<f64> = predicted.iter().zip(actual).map(|(p, a)| p - a).collect();
    let scale = residuals.iter().fold(0.0f64, |max, r| max.max(r.abs()));
    if !scale.is_finite() || residuals.iter().any(|r| r.is_nan()) {
        return Err(Error::InvalidInput("non-finite prediction or ground truth".to_string()));
    }
    if scale <= 0.0 {
        return Ok((0.0, vec![0.0; residuals.len()]));
    }
    Ok((scale, residuals.iter().map(|r| (r / scale) as f32).collect()))
}

#[allow(clippy::cast_precision_loss)]
fn len_f64(values: &[f64]) -> f64 {
    values.len() as f64
}

/// Compute the metrics record of one run attempt without storing it.
///
/// # Errors
///
/// Returns `InvalidInput` if the outcome holds no forecast or the forecast
/// and ground truth disagree in length.
pub fn score(run: &RunRecord, outcome: &RunOutcome) -> Result<RunMetrics> {
    let rmse = rmse(outcome.forecast(), outcome.ground_truth())?;
    let mae = mae(outcome.forecast(), outcome.ground_truth())?;
    let scenario = outcome.scenario();

    Ok(RunMetrics::builder(run.run_id(), run.scenario_id())
        .condition(scenario.complexity(), scenario.noise_level())
        .model(outcome.coefficient(), outcome.intercept())
        .accuracy(rmse, mae)
        .timings(
            outcome.fit_time().as_secs_f64() * 1000.0,
            outcome.predict_time().as_secs_f64() * 1000.0,
            outcome.join_time().as_secs_f64() * 1000.0,
        )
        .sla_violated(outcome.sla_violated())
        .partial_data(outcome.partial_data())
        .sample_count(outcome.sample_count())
        .attempts(run.attempt_count())
        .recorded_at(Utc::now())
        .build())
}

#[derive(Default)]
struct ResultSet {
    rows: Vec<RunMetrics>,
    by_run: HashMap<String, usize>,
}

/// Append-only store of per-run metrics.
#[derive(Default)]
pub struct MetricsAggregator {
    inner: Mutex<ResultSet>,
}

impl MetricsAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Score a successful run and append its metrics.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` unless `run` is `Succeeded` or if the outcome
    /// cannot be scored, and `DuplicateMetrics` if the run already has a
    /// record.
    pub fn record(&self, run: &RunRecord, outcome: &RunOutcome) -> Result<RunMetrics> {
        if run.state() != RunState::Succeeded {
            return Err(Error::InvalidInput(format!(
                "run {} is {}, only succeeded runs are scored",
                run.run_id(),
                run.state()
            )));
        }
        let metrics = score(run, outcome)?;
        self.append(metrics.clone())?;
        Ok(metrics)
    }

    /// Append an already computed record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateMetrics` if the run already has a record.
    pub fn append(&self, metrics: RunMetrics) -> Result<()> {
        let mut set = self.lock();
        if set.by_run.contains_key(metrics.run_id()) {
            return Err(Error::DuplicateMetrics(metrics.run_id().to_string()));
        }
        let index = set.rows.len();
        set.by_run.insert(metrics.run_id().to_string(), index);
        info!(
            run_id = metrics.run_id(),
            rmse = metrics.rmse(),
            mae = metrics.mae(),
            sla_violated = metrics.sla_violated(),
            "metrics recorded"
        );
        set.rows.push(metrics);
        Ok(())
    }

    /// Records of one scenario, in completion order.
    #[must_use]
    pub fn for_scenario(&self, scenario_id: &str) -> Vec<RunMetrics> {
        self.lock()
            .rows
            .iter()
            .filter(|m| m.scenario_id() == scenario_id)
            .cloned()
            .collect()
    }

    /// Record of one run.
    #[must_use]
    pub fn for_run(&self, run_id: &str) -> Option<RunMetrics> {
        let set = self.lock();
        set.by_run.get(run_id).map(|&i| set.rows[i].clone())
    }

    /// Every record, in completion order.
    #[must_use]
    pub fn all(&self) -> Vec<RunMetrics> {
        self.lock().rows.clone()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    /// Check if no run has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, ResultSet> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(run_id: &str, scenario_id: &str) -> RunMetrics {
        RunMetrics::builder(run_id, scenario_id).accuracy(1.0, 0.5).build()
    }

    #[test]
    fn test_rmse_and_mae() {
        let predicted = [1.0, 2.0, 3.0, 4.0];
        let actual = [1.0, 4.0, 3.0, 2.0];
        assert!((rmse(&predicted, &actual).unwrap() - 2.0f64.sqrt()).abs() < 1e-6);
        assert!((mae(&predicted, &actual).unwrap() - 1.0).abs() < 1e-6);
        assert!(rmse(&predicted, &predicted).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_metric_input_validation() {
        assert!(rmse(&[], &[]).is_err());
        assert!(mae(&[1.0], &[1.0, 2.0]).is_err());
        assert!(rmse(&[f64::NAN], &[1.0]).is_err());
        assert!(mae(&[f64::INFINITY], &[1.0]).is_err());
    }

    #[test]
    fn test_accuracy_holds_outside_single_precision_range() {
        // squares of these residuals underflow or overflow an f32
        for residual in [1e-25, 1e25] {
            let actual = vec![0.0; 10];
            let predicted = vec![residual; 10];
            let rmse = rmse(&predicted, &actual).unwrap();
            let mae = mae(&predicted, &actual).unwrap();
            assert!(((rmse - residual) / residual).abs() < 1e-5, "rmse {rmse} for {residual}");
            assert!(((mae - residual) / residual).abs() < 1e-5, "mae {mae} for {residual}");
        }
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_long_series_matches_f64_reference() {
        let actual: Vec<f64> = (0..100_000).map(|i| (i % 97) as f64).collect();
        let predicted: Vec<f64> = actual
            .iter()
            .enumerate()
            .map(|(i, a)| a + ((i % 13) as f64 - 6.0) * 0.01)
            .collect();
        let n = actual.len() as f64;
        let reference_rmse = (predicted
            .iter()
            .zip(&actual)
            .map(|(p, a)| (p - a) * (p - a))
            .sum::<f64>()
            / n)
            .sqrt();
        let reference_mae = predicted.iter().zip(&actual).map(|(p, a)| (p - a).abs()).sum::<f64>() / n;

        let rmse = rmse(&predicted, &actual).unwrap();
        let mae = mae(&predicted, &actual).unwrap();
        assert!(((rmse - reference_rmse) / reference_rmse).abs() < 1e-5);
        assert!(((mae - reference_mae) / reference_mae).abs() < 1e-5);
    }

    #[test]
    fn test_append_rejects_duplicates() {
        let aggregator = MetricsAggregator::new();
        aggregator.append(metrics("r1", "s")).unwrap();
        let err = aggregator.append(metrics("r1", "s")).unwrap_err();
        assert!(matches!(err, Error::DuplicateMetrics(_)));
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn test_for_scenario_keeps_completion_order() {
        let aggregator = MetricsAggregator::new();
        aggregator.append(metrics("s-rep002", "s")).unwrap();
        aggregator.append(metrics("t-rep000", "t")).unwrap();
        aggregator.append(metrics("s-rep000", "s")).unwrap();

        let ids: Vec<String> = aggregator
            .for_scenario("s")
            .iter()
            .map(|m| m.run_id().to_string())
            .collect();
        assert_eq!(ids, vec!["s-rep002", "s-rep000"]);
        assert!(aggregator.for_run("t-rep000").is_some());
        assert!(aggregator.for_scenario("none").is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: MAE <= RMSE for any residual vector
            #[test]
            fn prop_mae_bounded_by_rmse(
                pairs in prop::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 1..200)
            ) {
                let (p, a): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
                let rmse = rmse(&p, &a).unwrap();
                let mae = mae(&p, &a).unwrap();
                prop_assert!(mae <= rmse * (1.0 + 1e-4) + 1e-4);
                prop_assert!(rmse >= 0.0);
            }
        }
    }
}
