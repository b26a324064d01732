//! Run Metrics - accuracy and timing record for one successful run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run Metrics is the single, append-only outcome record of a successful run.
///
/// Carries the model diagnostics (coefficient/intercept), the accuracy of the
/// predictions against ground truth, and the timings of the fit, predict and
/// join steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    run_id: String,
    scenario_id: String,
    complexity: u8,
    noise_level: f64,
    coefficient: f64,
    intercept: f64,
    rmse: f64,
    mae: f64,
    fit_ms: f64,
    predict_ms: f64,
    join_ms: f64,
    sla_violated: bool,
    partial_data: bool,
    sample_count: u64,
    attempts: u32,
    recorded_at: DateTime<Utc>,
}

impl RunMetrics {
    /// Create a builder with the identifying fields.
    #[must_use]
    pub fn builder(run_id: impl Into<String>, scenario_id: impl Into<String>) -> RunMetricsBuilder {
        RunMetricsBuilder::new(run_id, scenario_id)
    }

    /// Get the run ID.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Get the scenario ID.
    #[must_use]
    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Scenario complexity level.
    #[must_use]
    pub const fn complexity(&self) -> u8 {
        self.complexity
    }

    /// Scenario noise level.
    #[must_use]
    pub const fn noise_level(&self) -> f64 {
        self.noise_level
    }

    /// Fitted coefficient.
    #[must_use]
    pub const fn coefficient(&self) -> f64 {
        self.coefficient
    }

    /// Fitted intercept.
    #[must_use]
    pub const fn intercept(&self) -> f64 {
        self.intercept
    }

    /// Root mean squared error of the predictions.
    #[must_use]
    pub const fn rmse(&self) -> f64 {
        self.rmse
    }

    /// Mean absolute error of the predictions.
    #[must_use]
    pub const fn mae(&self) -> f64 {
        self.mae
    }

    /// Wall time of `fit` in milliseconds.
    #[must_use]
    pub const fn fit_ms(&self) -> f64 {
        self.fit_ms
    }

    /// Total wall time of the `predict` calls in milliseconds.
    #[must_use]
    pub const fn predict_ms(&self) -> f64 {
        self.predict_ms
    }

    /// Wall time of the external-data lookup in milliseconds.
    #[must_use]
    pub const fn join_ms(&self) -> f64 {
        self.join_ms
    }

    /// Whether predict + join exceeded the latency SLA.
    #[must_use]
    pub const fn sla_violated(&self) -> bool {
        self.sla_violated
    }

    /// Whether the run proceeded without a complete external lookup.
    #[must_use]
    pub const fn partial_data(&self) -> bool {
        self.partial_data
    }

    /// Samples collected by the run.
    #[must_use]
    pub const fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Attempts the run needed to succeed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// When the record was appended.
    #[must_use]
    pub const fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

/// Builder for `RunMetrics`.
#[derive(Debug)]
pub struct RunMetricsBuilder {
    inner: RunMetrics,
}

impl RunMetricsBuilder {
    /// Create a new builder with required fields; everything else is zeroed.
    #[must_use]
    pub fn new(run_id: impl Into<String>, scenario_id: impl Into<String>) -> Self {
        Self {
            inner: RunMetrics {
                run_id: run_id.into(),
                scenario_id: scenario_id.into(),
                complexity: 0,
                noise_level: 0.0,
                coefficient: 0.0,
                intercept: 0.0,
                rmse: 0.0,
                mae: 0.0,
                fit_ms: 0.0,
                predict_ms: 0.0,
                join_ms: 0.0,
                sla_violated: false,
                partial_data: false,
                sample_count: 0,
                attempts: 1,
                recorded_at: Utc::now(),
            },
        }
    }

    /// Set the scenario parameters that drive comparisons.
    #[must_use]
    pub const fn condition(mut self, complexity: u8, noise_level: f64) -> Self {
        self.inner.complexity = complexity;
        self.inner.noise_level = noise_level;
        self
    }

    /// Set the fitted model parameters.
    #[must_use]
    pub const fn model(mut self, coefficient: f64, intercept: f64) -> Self {
        self.inner.coefficient = coefficient;
        self.inner.intercept = intercept;
        self
    }

    /// Set the accuracy metrics.
    #[must_use]
    pub const fn accuracy(mut self, rmse: f64, mae: f64) -> Self {
        self.inner.rmse = rmse;
        self.inner.mae = mae;
        self
    }

    /// Set fit, predict and join timings in milliseconds.
    #[must_use]
    pub const fn timings(mut self, fit_ms: f64, predict_ms: f64, join_ms: f64) -> Self {
        self.inner.fit_ms = fit_ms;
        self.inner.predict_ms = predict_ms;
        self.inner.join_ms = join_ms;
        self
    }

    /// Mark the latency SLA as violated.
    #[must_use]
    pub const fn sla_violated(mut self, violated: bool) -> Self {
        self.inner.sla_violated = violated;
        self
    }

    /// Mark the run as having proceeded with partial external data.
    #[must_use]
    pub const fn partial_data(mut self, partial: bool) -> Self {
        self.inner.partial_data = partial;
        self
    }

    /// Set the sample count.
    #[must_use]
    pub const fn sample_count(mut self, count: u64) -> Self {
        self.inner.sample_count = count;
        self
    }

    /// Set the attempt count.
    #[must_use]
    pub const fn attempts(mut self, attempts: u32) -> Self {
        self.inner.attempts = attempts;
        self
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.inner.recorded_at = recorded_at;
        self
    }

    /// Build the `RunMetrics`.
    #[must_use]
    pub fn build(self) -> RunMetrics {
        self.inner
    }
}
