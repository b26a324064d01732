//! Per-run execution
//!
//! [`RunExecutor`] is the seam between the orchestrator and the body of a
//! run. [`Pipeline`] is the production executor:
//!
//! ```text
//! ┌───────────────────────┐   ┌─────────────────────────┐
//! │ telemetry (paced)     │   │ gateway lookup (timeout)│
//! └──────────┬────────────┘   └────────────┬────────────┘
//!            └──────── barrier ────────────┘
//!                         │ partial-data policy
//!                         ▼
//!                 fuse windows ─> fit ─> predict per window ─> SLA check
//! ```
//!
//! Cancellation reaches the collector and the lookup directly and is checked
//! before every `predict`; a `predict` already in flight finishes (bounded by
//! its deadline).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::config::ExperimentConfig;
use crate::experiment::{PartialDataPolicy, RunPlan, ScenarioSpec};
use crate::fusion::FusedWindow;
use crate::gateway::{DataSource, ExternalRow, RowQuery, VirtualDataGateway};
use crate::model::{Diagnostics, Prediction, WorldModel, WorldModelService};
use crate::telemetry::{SignalSource, TelemetryCollector};
use crate::{Error, Result};

/// What an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct RunContext {
    plan: RunPlan,
    attempt: u32,
    cancel: CancelSignal,
}

impl RunContext {
    /// Create a context.
    #[must_use]
    pub const fn new(plan: RunPlan, attempt: u32, cancel: CancelSignal) -> Self {
        Self {
            plan,
            attempt,
            cancel,
        }
    }

    /// The run being executed.
    #[must_use]
    pub const fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// One-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cancellation signal of the run.
    #[must_use]
    pub const fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }

    fn check_cancelled(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled(format!("{} cancelled before {stage}", self.plan.run_id())))
        } else {
            Ok(())
        }
    }
}

/// Executes one attempt of a run.
pub trait RunExecutor: Send + Sync + 'static {
    /// Run the attempt to completion or failure.
    fn execute(&self, ctx: RunContext) -> impl Future<Output = Result<RunOutcome>> + Send;
}

/// Everything a successful attempt produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    scenario: ScenarioSpec,
    predictions: Vec<Prediction>,
    forecast: Vec<f64>,
    ground_truth: Vec<f64>,
    coefficient: f64,
    intercept: f64,
    fit_time: Duration,
    predict_time: Duration,
    join_time: Duration,
    sample_count: u64,
    partial_data: bool,
    sla_violated: bool,
}

impl RunOutcome {
    /// Start an outcome for `scenario`; used by custom executors.
    #[must_use]
    pub fn builder(scenario: ScenarioSpec) -> RunOutcomeBuilder {
        RunOutcomeBuilder {
            inner: Self {
                scenario,
                predictions: Vec::new(),
                forecast: Vec::new(),
                ground_truth: Vec::new(),
                coefficient: 0.0,
                intercept: 0.0,
                fit_time: Duration::ZERO,
                predict_time: Duration::ZERO,
                join_time: Duration::ZERO,
                sample_count: 0,
                partial_data: false,
                sla_violated: false,
            },
        }
    }

    /// Scenario the run executed.
    #[must_use]
    pub const fn scenario(&self) -> &ScenarioSpec {
        &self.scenario
    }

    /// Per-window predictions (empty for executors that only report a
    /// flat forecast).
    #[must_use]
    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    /// Every forecast value, aligned with [`ground_truth`](Self::ground_truth).
    #[must_use]
    pub fn forecast(&self) -> &[f64] {
        &self.forecast
    }

    /// Observed positions.
    #[must_use]
    pub fn ground_truth(&self) -> &[f64] {
        &self.ground_truth
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

    /// Wall time of `fit`.
    #[must_use]
    pub const fn fit_time(&self) -> Duration {
        self.fit_time
    }

    /// Summed wall time of every `predict`.
    #[must_use]
    pub const fn predict_time(&self) -> Duration {
        self.predict_time
    }

    /// Wall time of the gateway lookup.
    #[must_use]
    pub const fn join_time(&self) -> Duration {
        self.join_time
    }

    /// Samples collected.
    #[must_use]
    pub const fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Whether the run continued without external rows.
    #[must_use]
    pub const fn partial_data(&self) -> bool {
        self.partial_data
    }

    /// Whether lookup plus predict exceeded the SLA.
    #[must_use]
    pub const fn sla_violated(&self) -> bool {
        self.sla_violated
    }
}

/// Builder for [`RunOutcome`].
#[derive(Debug)]
pub struct RunOutcomeBuilder {
    inner: RunOutcome,
}

impl RunOutcomeBuilder {
    /// Set the per-window predictions and their ground truth; the flat
    /// forecast is derived from them.
    #[must_use]
    pub fn predictions(mut self, predictions: Vec<Prediction>, ground_truth: Vec<f64>) -> Self {
        self.inner.forecast = predictions
            .iter()
            .flat_map(|p| p.forecast().iter().copied())
            .collect();
        self.inner.predictions = predictions;
        self.inner.ground_truth = ground_truth;
        self
    }

    /// Set a flat forecast and its ground truth.
    #[must_use]
    pub fn forecast(mut self, forecast: Vec<f64>, ground_truth: Vec<f64>) -> Self {
        self.inner.forecast = forecast;
        self.inner.ground_truth = ground_truth;
        self
    }

    /// Set the fitted model parameters.
    #[must_use]
    pub const fn model(mut self, coefficient: f64, intercept: f64) -> Self {
        self.inner.coefficient = coefficient;
        self.inner.intercept = intercept;
        self
    }

    /// Set fit, predict and join wall times.
    #[must_use]
    pub const fn timings(mut self, fit: Duration, predict: Duration, join: Duration) -> Self {
        self.inner.fit_time = fit;
        self.inner.predict_time = predict;
        self.inner.join_time = join;
        self
    }

    /// Set the sample count.
    #[must_use]
    pub const fn sample_count(mut self, count: u64) -> Self {
        self.inner.sample_count = count;
        self
    }

    /// Mark the outcome as built from partial external data.
    #[must_use]
    pub const fn partial_data(mut self, partial: bool) -> Self {
        self.inner.partial_data = partial;
        self
    }

    /// Mark the latency SLA as violated.
    #[must_use]
    pub const fn sla_violated(mut self, violated: bool) -> Self {
        self.inner.sla_violated = violated;
        self
    }

    /// Build the outcome.
    #[must_use]
    pub fn build(self) -> RunOutcome {
        self.inner
    }
}

/// Production executor: telemetry + gateway + world model.
pub struct Pipeline<G, S, M> {
    collector: TelemetryCollector<S>,
    gateway: VirtualDataGateway<G>,
    model: Arc<WorldModelService<M>>,
    config: ExperimentConfig,
}

impl<G, S, M> Pipeline<G, S, M>
where
    G: DataSource,
    S: SignalSource,
    M: WorldModel,
{
    /// Wire a pipeline from its three collaborators.
    #[must_use]
    pub fn new(source: S, data: G, model: M, config: &ExperimentConfig) -> Self {
        Self {
            collector: TelemetryCollector::new(
                Arc::new(source),
                config.sampling.clone(),
                config.model.seed,
            ),
            gateway: VirtualDataGateway::new(data, config.gateway.clone()),
            model: Arc::new(WorldModelService::new(model, config.model.seed)),
            config: config.clone(),
        }
    }

    /// World model service shared by every run of this pipeline.
    #[must_use]
    pub fn model(&self) -> &WorldModelService<M> {
        &self.model
    }

    async fn lookup(
        &self,
        ctx: &RunContext,
        query: &RowQuery,
    ) -> Result<(Vec<ExternalRow>, bool, Duration)> {
        let scenario = ctx.plan().scenario();
        let latency = Duration::from_millis(scenario.latency_ms());
        let started = Instant::now();

        let fetched = tokio::select! {
            biased;
            () = ctx.cancel().cancelled() => {
                return Err(Error::Cancelled(format!("{} cancelled during lookup", ctx.plan().run_id())));
            }
            fetched = self.gateway.fetch_with_latency(query, latency) => fetched,
        };
        let join_time = started.elapsed();

        match fetched {
            Ok(rows) => Ok((rows, false, join_time)),
            Err(e @ Error::DataUnavailable { .. }) => match scenario.partial_data() {
                PartialDataPolicy::Abort => Err(e),
                PartialDataPolicy::ProceedWithPartial => {
                    warn!(
                        run_id = ctx.plan().run_id(),
                        error = %e,
                        "proceeding without external rows"
                    );
                    Ok((Vec::new(), true, join_time))
                }
            },
            Err(e) => Err(e),
        }
    }
}

impl<G, S, M> RunExecutor for Pipeline<G, S, M>
where
    G: DataSource,
    S: SignalSource,
    M: WorldModel,
{
    async fn execute(&self, ctx: RunContext) -> Result<RunOutcome> {
        ctx.check_cancelled("sampling")?;
        let plan = ctx.plan();
        let query = RowQuery::new(
            self.gateway.table(),
            plan.scenario().id(),
            0..=self.config.sampling.buckets_per_run().saturating_sub(1),
        );

        let stream = self.collector.start(plan, ctx.cancel().clone());
        let (samples, (rows, partial_data, join_time)) =
            tokio::try_join!(stream.collect(), self.lookup(&ctx, &query))?;
        let sample_count = samples.len() as u64;
        debug!(
            run_id = plan.run_id(),
            samples = sample_count,
            rows = rows.len(),
            partial_data,
            "telemetry and external rows joined"
        );

        ctx.check_cancelled("fit")?;
        let windows = FusedWindow::assemble(samples, rows, self.config.sampling.window_size)?;
        let handle = self.model.fit(&windows, self.config.model.fit_deadline()).await?;

        let predict_deadline = self.config.model.predict_deadline();
        let mut predictions = Vec::with_capacity(windows.len());
        let mut ground_truth = Vec::with_capacity(windows.iter().map(FusedWindow::len).sum());
        let mut predict_time = Duration::ZERO;
        for window in &windows {
            ctx.check_cancelled("predict")?;
            let prediction = self.model.predict(&handle, window, predict_deadline).await?;
            predict_time += prediction.latency();
            ground_truth.extend(window.positions());
            predictions.push(prediction);
        }

        let serving_time = join_time + predict_time;
        let sla_violated = serving_time > self.config.sla();
        if sla_violated {
            warn!(
                run_id = plan.run_id(),
                serving_ms = serving_time.as_secs_f64() * 1000.0,
                sla_ms = self.config.sla_ms,
                "latency SLA violated"
            );
        }

        Ok(RunOutcome::builder(plan.scenario().clone())
            .predictions(predictions, ground_truth)
            .model(handle.coefficient(), handle.intercept())
            .timings(handle.fit_time(), predict_time, join_time)
            .sample_count(sample_count)
            .partial_data(partial_data)
            .sla_violated(sla_violated)
            .build())
    }
}
