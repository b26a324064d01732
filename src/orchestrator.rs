//! Scenario Orchestrator
//!
//! Turns a [`ScenarioGrid`] into terminal runs:
//!
//! - Runs are admitted in grid order through a fair semaphore sized to the
//!   worker limit, so runs beyond the limit queue FIFO.
//! - Transient failures are retried up to the retry budget; every attempt is
//!   recorded in the [`RunRegistry`]. Anything else is terminal immediately.
//! - A failing or panicking run never aborts the batch.
//! - Terminal runs are broadcast as [`RunEvent`]s for live progress, and
//!   [`Orchestrator::run_batch`] returns the full [`BatchReport`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::cancel::{CancelHandle, CancelSignal};
use crate::config::OrchestratorConfig;
use crate::error::ErrorKind;
use crate::experiment::{RunMetrics, RunPlan, RunRecord, RunState, RunTransition, ScenarioGrid};
use crate::metrics::{self, MetricsAggregator};
use crate::observability::{batch_span, run_span};
use crate::pipeline::{RunContext, RunExecutor, RunOutcome};
use crate::registry::RunRegistry;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 1024;
const MAX_BACKOFF_DOUBLINGS: u32 = 10;

/// Notification that a run reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEvent {
    /// Run identifier.
    pub run_id: String,
    /// Scenario the run belongs to.
    pub scenario_id: String,
    /// Terminal state.
    pub state: RunState,
    /// Attempts made.
    pub attempts: u32,
    /// Final error kind for failed or cancelled runs.
    pub error_kind: Option<ErrorKind>,
}

impl RunEvent {
    fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id().to_string(),
            scenario_id: record.scenario_id().to_string(),
            state: record.state(),
            attempts: record.attempt_count(),
            error_kind: record.error_kind(),
        }
    }
}

/// Per-scenario outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioSummary {
    /// Scenario identifier.
    pub scenario_id: String,
    /// Runs of the scenario in this batch.
    pub runs: usize,
    /// Runs that succeeded.
    pub succeeded: usize,
    /// Runs that failed permanently.
    pub failed: usize,
    /// Runs that were cancelled.
    pub cancelled: usize,
    /// Successful runs whose serving path exceeded the SLA.
    pub sla_violations: usize,
    /// Attempts that ended in `DeadlineExceeded`.
    pub deadline_misses: usize,
}

/// A run that did not succeed, with its final error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRun {
    /// Run identifier.
    pub run_id: String,
    /// Scenario the run belongs to.
    pub scenario_id: String,
    /// Final error kind.
    pub error_kind: ErrorKind,
    /// Rendered final error.
    pub detail: String,
    /// Attempts made.
    pub attempts: u32,
}

/// Everything one batch produced.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    runs: Vec<RunRecord>,
    metrics: Vec<RunMetrics>,
    scenarios: BTreeMap<String, ScenarioSummary>,
    failures: Vec<FailedRun>,
    sla_violations: usize,
    deadline_misses: usize,
}

impl BatchReport {
    fn build(runs: Vec<RunRecord>, metrics: Vec<RunMetrics>) -> Self {
        let violated: HashSet<&str> = metrics
            .iter()
            .filter(|m| m.sla_violated())
            .map(RunMetrics::run_id)
            .collect();

        let mut scenarios: BTreeMap<String, ScenarioSummary> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut deadline_misses = 0;

        for run in &runs {
            let summary = scenarios
                .entry(run.scenario_id().to_string())
                .or_insert_with(|| ScenarioSummary {
                    scenario_id: run.scenario_id().to_string(),
                    ..ScenarioSummary::default()
                });
            summary.runs += 1;

            let misses = run
                .attempts()
                .iter()
                .filter(|a| a.error_kind() == Some(ErrorKind::DeadlineExceeded))
                .count();
            summary.deadline_misses += misses;
            deadline_misses += misses;

            match run.state() {
                RunState::Succeeded => {
                    summary.succeeded += 1;
                    if violated.contains(run.run_id()) {
                        summary.sla_violations += 1;
                    }
                }
                RunState::Failed | RunState::Cancelled => {
                    if run.state() == RunState::Failed {
                        summary.failed += 1;
                    } else {
                        summary.cancelled += 1;
                    }
                    failures.push(FailedRun {
                        run_id: run.run_id().to_string(),
                        scenario_id: run.scenario_id().to_string(),
                        error_kind: run.error_kind().unwrap_or(ErrorKind::Internal),
                        detail: run.error_detail().unwrap_or_default().to_string(),
                        attempts: run.attempt_count(),
                    });
                }
                RunState::Pending | RunState::Running | RunState::Retrying => {}
            }
        }

        Self {
            sla_violations: violated.len(),
            runs,
            metrics,
            scenarios,
            failures,
            deadline_misses,
        }
    }

    /// Terminal runs, in grid order.
    #[must_use]
    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    /// Metrics of this batch's successful runs, in completion order.
    #[must_use]
    pub fn metrics(&self) -> &[RunMetrics] {
        &self.metrics
    }

    /// Outcome counts keyed by scenario id.
    #[must_use]
    pub const fn scenarios(&self) -> &BTreeMap<String, ScenarioSummary> {
        &self.scenarios
    }

    /// Failed and cancelled runs with their final error kind.
    #[must_use]
    pub fn failures(&self) -> &[FailedRun] {
        &self.failures
    }

    /// Successful runs that violated the latency SLA.
    #[must_use]
    pub const fn sla_violations(&self) -> usize {
        self.sla_violations
    }

    /// Attempts across the batch that missed a model deadline.
    #[must_use]
    pub const fn deadline_misses(&self) -> usize {
        self.deadline_misses
    }

    /// Number of runs that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.state() == RunState::Succeeded)
            .count()
    }
}

/// Delay before the attempt that follows `attempt`.
///
/// Deadline misses back off exponentially (`backoff · 2^(attempt-1)`), other
/// transient failures wait the flat base backoff.
#[must_use]
pub fn backoff_delay(config: &OrchestratorConfig, kind: ErrorKind, attempt: u32) -> Duration {
    let base = config.backoff();
    if kind == ErrorKind::DeadlineExceeded {
        let doublings = attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
        base.saturating_mul(1 << doublings)
    } else {
        base
    }
}

struct Shared<E, R> {
    executor: E,
    registry: Arc<R>,
    aggregator: Arc<MetricsAggregator>,
    config: OrchestratorConfig,
    cancels: DashMap<String, CancelHandle>,
    events: broadcast::Sender<RunEvent>,
}

/// Schedules, retries and tracks the runs of a batch.
pub struct Orchestrator<E, R> {
    shared: Arc<Shared<E, R>>,
}

impl<E, R> Orchestrator<E, R>
where
    E: RunExecutor,
    R: RunRegistry + 'static,
{
    /// Create an orchestrator. The registry must be closed; `run_batch`
    /// opens it and drains it when the batch completes.
    #[must_use]
    pub fn new(
        executor: E,
        registry: Arc<R>,
        aggregator: Arc<MetricsAggregator>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                executor,
                registry,
                aggregator,
                config,
                cancels: DashMap::new(),
                events,
            }),
        }
    }

    /// Subscribe to terminal-run notifications.
    ///
    /// Receivers that fall more than 1024 events behind observe `Lagged`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.shared.events.subscribe()
    }

    /// Result set shared with the caller.
    #[must_use]
    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.shared.aggregator
    }

    /// Cancel one run of the current batch.
    ///
    /// A queued run is cancelled without starting; a running one stops at
    /// its next cancellation point. Cancelling a finished run has no effect.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the id is not part of the current batch.
    pub fn cancel_run(&self, run_id: &str) -> Result<()> {
        let handle = self
            .shared
            .cancels
            .get(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        info!(run_id, "run cancellation requested");
        handle.cancel();
        Ok(())
    }

    /// Cancel every run of the current batch and return how many were
    /// signalled.
    pub fn cancel_all(&self) -> usize {
        let mut signalled = 0;
        for entry in &self.shared.cancels {
            if !entry.value().is_cancelled() {
                entry.value().cancel();
                signalled += 1;
            }
        }
        info!(signalled, "batch cancellation requested");
        signalled
    }

    /// Run every run of `grid` to a terminal state.
    ///
    /// Runs already terminal in the registry (restored from a snapshot) are
    /// not executed again. Restored runs keep the attempts they spent; one
    /// whose attempts already exhaust the retry budget fails without
    /// executing. A run whose metrics the aggregator already holds (an
    /// earlier batch on the same orchestrator) fails with `DuplicateMetrics`
    /// instead of producing a second record.
    ///
    /// # Errors
    ///
    /// Fails only on registry lifecycle errors (already open, cannot drain).
    /// Individual run failures are reported in the [`BatchReport`].
    pub async fn run_batch(&self, grid: &ScenarioGrid) -> Result<BatchReport> {
        let span = batch_span(grid.run_count(), self.shared.config.worker_limit);
        self.execute_batch(grid).instrument(span).await
    }

    async fn execute_batch(&self, grid: &ScenarioGrid) -> Result<BatchReport> {
        let shared = &self.shared;
        let plans = grid.runs();

        shared.registry.init().await?;
        shared.cancels.clear();
        info!(
            scenarios = grid.len(),
            runs = plans.len(),
            worker_limit = shared.config.worker_limit,
            retry_budget = shared.config.retry_budget,
            "batch started"
        );

        let mut queue = Vec::with_capacity(plans.len());
        for plan in &plans {
            let record = shared.registry.register(plan).await?;
            let handle = CancelHandle::new();
            shared.cancels.insert(plan.run_id().to_string(), handle.clone());
            if record.state().is_terminal() {
                debug!(run_id = plan.run_id(), state = %record.state(), "run already terminal, skipping");
                continue;
            }
            queue.push((plan.clone(), handle));
        }

        let semaphore = Arc::new(Semaphore::new(shared.config.worker_limit.max(1)));
        let mut tasks = JoinSet::new();

        for (plan, handle) in queue {
            let signal = handle.signal();
            let permit = tokio::select! {
                biased;
                () = signal.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => Some(
                    permit.map_err(|e| Error::Other(format!("worker pool closed: {e}")))?,
                ),
            };
            let Some(permit) = permit else {
                shared.settle(plan.run_id(), shared.cancel(plan.run_id(), "cancelled before start").await);
                continue;
            };

            debug!(run_id = plan.run_id(), "run scheduled");
            let span = run_span(plan.run_id(), &plan.scenario().id());
            let shared = Arc::clone(shared);
            tasks.spawn(async move {
                let _permit = permit;
                let run_id = plan.run_id().to_string();
                let driver = tokio::spawn(Arc::clone(&shared).drive(plan, signal).instrument(span));
                match driver.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(run_id = %run_id, error = %e, "run driver failed");
                        shared.abandon(&run_id, &e).await;
                    }
                    Err(join_error) => {
                        error!(run_id = %run_id, error = %join_error, "run panicked");
                        let e = Error::SimulationFailure(format!("run task panicked: {join_error}"));
                        shared.abandon(&run_id, &e).await;
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "run supervisor task failed");
            }
        }

        let records = shared.registry.drain().await?;
        let mut by_id: HashMap<String, RunRecord> = records
            .into_iter()
            .map(|r| (r.run_id().to_string(), r))
            .collect();
        let runs: Vec<RunRecord> = plans
            .iter()
            .filter_map(|p| by_id.remove(p.run_id()))
            .collect();

        let batch_ids: HashSet<&str> = runs
            .iter()
            .filter(|r| r.state() == RunState::Succeeded)
            .map(RunRecord::run_id)
            .collect();
        let metrics: Vec<RunMetrics> = shared
            .aggregator
            .all()
            .into_iter()
            .filter(|m| batch_ids.contains(m.run_id()))
            .collect();

        let report = BatchReport::build(runs, metrics);
        info!(
            runs = report.runs().len(),
            succeeded = report.succeeded(),
            failed = report.failures().len(),
            sla_violations = report.sla_violations(),
            deadline_misses = report.deadline_misses(),
            "batch drained"
        );
        Ok(report)
    }
}

impl<E, R> Shared<E, R>
where
    E: RunExecutor,
    R: RunRegistry + 'static,
{
    async fn drive(self: Arc<Self>, plan: RunPlan, signal: CancelSignal) -> Result<()> {
        let run_id = plan.run_id();
        if let Some(record) = self.refuse(run_id).await? {
            self.emit(&record);
            return Ok(());
        }

        loop {
            if signal.is_cancelled() {
                let record = self.cancel(run_id, "cancelled before attempt").await?;
                self.emit(&record);
                return Ok(());
            }

            let attempt = self.registry.record_attempt(run_id).await?;
            info!(run_id, attempt, "run started");
            let ctx = RunContext::new(plan.clone(), attempt, signal.clone());

            match self.executor.execute(ctx).await {
                Ok(outcome) => {
                    let record = self.succeed(run_id, &outcome).await?;
                    self.emit(&record);
                    return Ok(());
                }
                Err(e) if matches!(e, Error::Cancelled(_)) || signal.is_cancelled() => {
                    let record = self.cancel(run_id, &e.to_string()).await?;
                    self.emit(&record);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt <= self.config.retry_budget => {
                    self.registry
                        .transition(run_id, RunTransition::retry(&e))
                        .await?;
                    let delay = backoff_delay(&self.config, e.kind(), attempt);
                    warn!(
                        run_id,
                        attempt,
                        kind = %e.kind(),
                        error = %e,
                        backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "run retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = signal.cancelled() => {}
                    }
                }
                Err(e) => {
                    let record = self
                        .registry
                        .transition(run_id, RunTransition::fail(&e))
                        .await?;
                    self.emit(&record);
                    return Ok(());
                }
            }
        }
    }

    /// Fail a run without executing it when it may not start again: its
    /// attempts (carried over from a restored snapshot) already exhaust the
    /// retry budget, or the aggregator already holds its metrics from an
    /// earlier batch.
    async fn refuse(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let record = self.registry.get(run_id).await?;

        if record.attempt_count() > self.config.retry_budget {
            let kind = record.last_error_kind().unwrap_or(ErrorKind::Internal);
            warn!(
                run_id,
                attempts = record.attempt_count(),
                retry_budget = self.config.retry_budget,
                "retry budget spent before resume, failing run"
            );
            let failed = self
                .registry
                .transition(
                    run_id,
                    RunTransition::Fail {
                        kind,
                        detail: format!(
                            "retry budget of {} spent after {} attempts",
                            self.config.retry_budget,
                            record.attempt_count()
                        ),
                    },
                )
                .await?;
            return Ok(Some(failed));
        }

        if self.aggregator.for_run(run_id).is_some() {
            let e = Error::DuplicateMetrics(run_id.to_string());
            warn!(run_id, error = %e, "run already has metrics, not executing it again");
            if record.state() == RunState::Pending {
                self.registry.record_attempt(run_id).await?;
            }
            let failed = self.registry.transition(run_id, RunTransition::fail(&e)).await?;
            return Ok(Some(failed));
        }

        Ok(None)
    }

    /// Score first, then win the terminal transition, then append: metrics
    /// only ever exist for runs that actually succeeded.
    async fn succeed(&self, run_id: &str, outcome: &RunOutcome) -> Result<RunRecord> {
        let running = self.registry.get(run_id).await?;
        let scored = match metrics::score(&running, outcome) {
            Ok(scored) => scored,
            Err(e) => {
                warn!(run_id, error = %e, "run outcome could not be scored");
                return self.registry.transition(run_id, RunTransition::fail(&e)).await;
            }
        };

        let record = self
            .registry
            .transition(
                run_id,
                RunTransition::Succeed {
                    sample_count: outcome.sample_count(),
                },
            )
            .await?;
        // the terminal write is final; the run still gets its event
        if let Err(e) = self.aggregator.append(scored) {
            error!(run_id, error = %e, "metrics of succeeded run not recorded");
        }
        Ok(record)
    }

    async fn cancel(&self, run_id: &str, detail: &str) -> Result<RunRecord> {
        self.registry
            .transition(
                run_id,
                RunTransition::Cancel {
                    detail: detail.to_string(),
                },
            )
            .await
    }

    fn settle(&self, run_id: &str, result: Result<RunRecord>) {
        match result {
            Ok(record) => self.emit(&record),
            Err(e) => error!(run_id, error = %e, "failed to record terminal state"),
        }
    }

    /// Force a run whose driver died into `Failed`, whatever state it was
    /// left in.
    async fn abandon(&self, run_id: &str, cause: &Error) {
        let state = match self.registry.get(run_id).await {
            Ok(record) => record.state(),
            Err(e) => {
                error!(run_id, error = %e, "abandoned run is not registered");
                return;
            }
        };
        let result = match state {
            RunState::Pending => match self.registry.record_attempt(run_id).await {
                Ok(_) => self.registry.transition(run_id, RunTransition::fail(cause)).await,
                Err(e) => Err(e),
            },
            RunState::Running | RunState::Retrying => {
                self.registry.transition(run_id, RunTransition::fail(cause)).await
            }
            RunState::Succeeded | RunState::Failed | RunState::Cancelled => return,
        };
        self.settle(run_id, result);
    }

    fn emit(&self, record: &RunRecord) {
        info!(
            run_id = record.run_id(),
            state = %record.state(),
            attempts = record.attempt_count(),
            error_kind = record.error_kind().map(|k| k.as_str()),
            "run terminal"
        );
        // no subscribers is fine
        let _ = self.events.send(RunEvent::from_record(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ScenarioSpec;
    use crate::registry::MemoryRunRegistry;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn outcome(spec: &ScenarioSpec) -> RunOutcome {
        RunOutcome::builder(spec.clone())
            .forecast(vec![1.0, 2.0, 3.0], vec![1.0, 2.5, 3.0])
            .model(2.0, 5.0)
            .sample_count(3)
            .build()
    }

    /// Fails the first `failures` attempts of every run with `error`.
    struct Flaky {
        failures: u32,
        error: fn() -> Error,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: fn() -> Error) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl RunExecutor for Flaky {
        async fn execute(&self, ctx: RunContext) -> Result<RunOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt() <= self.failures {
                Err((self.error)())
            } else {
                Ok(outcome(ctx.plan().scenario()))
            }
        }
    }

    struct PanicsOnComplexity(u8);

    impl RunExecutor for PanicsOnComplexity {
        async fn execute(&self, ctx: RunContext) -> Result<RunOutcome> {
            assert!(ctx.plan().scenario().complexity() != self.0, "simulator segfault");
            Ok(outcome(ctx.plan().scenario()))
        }
    }

    /// Sleeps until cancelled.
    struct Stalled;

    impl RunExecutor for Stalled {
        async fn execute(&self, ctx: RunContext) -> Result<RunOutcome> {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(30)) => Ok(outcome(ctx.plan().scenario())),
                () = ctx.cancel().cancelled() => Err(Error::Cancelled("stalled run".into())),
            }
        }
    }

    #[derive(Default)]
    struct Tracking {
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl RunExecutor for Tracking {
        async fn execute(&self, ctx: RunContext) -> Result<RunOutcome> {
            self.started.lock().unwrap().push(ctx.plan().run_id().to_string());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(outcome(ctx.plan().scenario()))
        }
    }

    fn config(worker_limit: usize, retry_budget: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            worker_limit,
            retry_budget,
            backoff_ms: 1,
        }
    }

    fn grid(repetitions: u32) -> ScenarioGrid {
        ScenarioGrid::builder()
            .complexities([1, 2])
            .noise_levels([0.0, 0.5])
            .repetitions(repetitions)
            .build()
            .unwrap()
    }

    fn orchestrator<E: RunExecutor>(
        executor: E,
        config: OrchestratorConfig,
    ) -> Orchestrator<E, MemoryRunRegistry> {
        Orchestrator::new(
            executor,
            Arc::new(MemoryRunRegistry::new()),
            Arc::new(MetricsAggregator::new()),
            config,
        )
    }

    #[tokio::test]
    async fn test_all_runs_succeed() {
        let orchestrator = orchestrator(Flaky::new(0, || Error::Other(String::new())), config(2, 2));
        let report = orchestrator.run_batch(&grid(1)).await.unwrap();

        assert_eq!(report.runs().len(), 4);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.metrics().len(), 4);
        assert!(report.failures().is_empty());
        assert_eq!(report.scenarios().len(), 4);
        assert!(report.scenarios().values().all(|s| s.runs == 1 && s.succeeded == 1));

        let ids: Vec<&str> = report.runs().iter().map(RunRecord::run_id).collect();
        let expected: Vec<String> = grid(1).runs().iter().map(|p| p.run_id().to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let orchestrator = orchestrator(
            Flaky::new(2, || Error::SimulationFailure("crash".into())),
            config(2, 2),
        );
        let report = orchestrator.run_batch(&grid(1)).await.unwrap();

        assert_eq!(report.succeeded(), 4);
        for run in report.runs() {
            assert_eq!(run.attempt_count(), 3);
            assert_eq!(run.attempts()[0].error_kind(), Some(ErrorKind::SimulationFailure));
        }
        assert!(report.metrics().iter().all(|m| m.attempts() == 3));
    }

    #[tokio::test]
    async fn test_retry_budget_is_respected() {
        let executor = Flaky::new(u32::MAX, || Error::DataUnavailable {
            table: "t".into(),
            reason: "timeout".into(),
        });
        let orchestrator = orchestrator(executor, config(4, 2));
        let report = orchestrator.run_batch(&grid(1)).await.unwrap();

        assert_eq!(report.succeeded(), 0);
        assert!(report.metrics().is_empty());
        assert_eq!(report.failures().len(), 4);
        for failure in report.failures() {
            assert_eq!(failure.error_kind, ErrorKind::DataUnavailable);
            assert_eq!(failure.attempts, 3);
        }
        assert!(report.scenarios().values().all(|s| s.failed == 1));
        assert_eq!(orchestrator.shared.executor.calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let orchestrator = orchestrator(
            Flaky::new(u32::MAX, || Error::ModelFitFailure("zero variance".into())),
            config(2, 5),
        );
        let report = orchestrator.run_batch(&grid(1)).await.unwrap();

        assert!(report.runs().iter().all(|r| r.attempt_count() == 1));
        assert!(report
            .failures()
            .iter()
            .all(|f| f.error_kind == ErrorKind::ModelFitFailure && f.detail.contains("zero variance")));
    }

    #[tokio::test]
    async fn test_deadline_misses_are_counted() {
        let orchestrator = orchestrator(
            Flaky::new(u32::MAX, || Error::DeadlineExceeded {
                operation: "predict".into(),
                budget_ms: 0,
            }),
            config(4, 1),
        );
        let report = orchestrator.run_batch(&grid(1)).await.unwrap();
        assert_eq!(report.deadline_misses(), 8);
        assert!(report.scenarios().values().all(|s| s.deadline_misses == 2));
    }

    #[tokio::test]
    async fn test_panicking_run_is_failed_not_leaked() {
        let orchestrator = orchestrator(PanicsOnComplexity(2), config(2, 0));
        let report = orchestrator.run_batch(&grid(1)).await.unwrap();

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failures().len(), 2);
        assert!(report
            .failures()
            .iter()
            .all(|f| f.error_kind == ErrorKind::SimulationFailure && f.scenario_id.starts_with("c2")));
        assert!(report.runs().iter().all(|r| r.state().is_terminal()));
    }

    #[tokio::test]
    async fn test_worker_limit_and_fifo_admission() {
        let orchestrator = orchestrator(Tracking::default(), config(2, 0));
        let report = orchestrator.run_batch(&grid(2)).await.unwrap();
        assert_eq!(report.succeeded(), 8);
        assert!(orchestrator.shared.executor.peak.load(Ordering::SeqCst) <= 2);

        let serial = self::orchestrator(Tracking::default(), config(1, 0));
        serial.run_batch(&grid(2)).await.unwrap();
        let started = serial.shared.executor.started.lock().unwrap().clone();
        let expected: Vec<String> = grid(2).runs().iter().map(|p| p.run_id().to_string()).collect();
        assert_eq!(started, expected);
    }

    #[tokio::test]
    async fn test_subscribers_see_every_terminal_run() {
        let orchestrator = orchestrator(Flaky::new(0, || Error::Other(String::new())), config(2, 0));
        let mut events = orchestrator.subscribe();
        orchestrator.run_batch(&grid(1)).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.state, RunState::Succeeded);
            seen.push(event.run_id);
        }
        seen.sort();
        assert_eq!(seen.len(), 4);
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_all_terminates_running_and_queued_runs() {
        let orchestrator = Arc::new(orchestrator(Stalled, config(1, 2)));
        let batch = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_batch(&grid(1)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.cancel_all(), 4);

        let report = tokio::time::timeout(Duration::from_secs(2), batch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.runs().len(), 4);
        assert!(report.runs().iter().all(|r| r.state() == RunState::Cancelled));
        assert!(report.scenarios().values().all(|s| s.cancelled == 1));
        assert!(report.failures().iter().all(|f| f.error_kind == ErrorKind::Cancelled));
        // only the admitted run ever started an attempt
        let attempts: u32 = report.runs().iter().map(RunRecord::attempt_count).sum();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let orchestrator = orchestrator(Stalled, config(1, 0));
        assert!(matches!(orchestrator.cancel_run("nope"), Err(Error::RunNotFound(_))));
    }

    #[tokio::test]
    async fn test_resumed_batch_skips_terminal_runs() {
        let grid = ScenarioGrid::from_specs([ScenarioSpec::new(1, 0.0).with_repetitions(2)]).unwrap();
        let plans = grid.runs();

        let previous = MemoryRunRegistry::new();
        previous.init().await.unwrap();
        for plan in &plans {
            previous.register(plan).await.unwrap();
        }
        previous.record_attempt(plans[0].run_id()).await.unwrap();
        previous
            .transition(plans[0].run_id(), RunTransition::Succeed { sample_count: 3 })
            .await
            .unwrap();
        previous.record_attempt(plans[1].run_id()).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        previous.snapshot_to(&path).unwrap();

        let orchestrator = Orchestrator::new(
            Flaky::new(0, || Error::Other(String::new())),
            Arc::new(MemoryRunRegistry::restore_from(&path).unwrap()),
            Arc::new(MetricsAggregator::new()),
            config(2, 1),
        );
        let report = orchestrator.run_batch(&grid).await.unwrap();

        // the interrupted run resumes as its second attempt
        assert_eq!(orchestrator.shared.executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.runs()[1].attempt_count(), 2);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.metrics().len(), 1);
        assert_eq!(report.metrics()[0].run_id(), plans[1].run_id());
    }

    #[tokio::test]
    async fn test_resumed_runs_keep_their_spent_attempts() {
        let grid = ScenarioGrid::from_specs([ScenarioSpec::new(1, 0.0).with_repetitions(3)]).unwrap();
        let plans = grid.runs();
        let unavailable = || Error::DataUnavailable {
            table: "t".into(),
            reason: "timeout".into(),
        };

        // written by a process that allowed more retries and then died
        let previous = MemoryRunRegistry::new();
        previous.init().await.unwrap();
        for plan in &plans {
            previous.register(plan).await.unwrap();
        }
        for _ in 0..3 {
            previous.record_attempt(plans[0].run_id()).await.unwrap();
            previous
                .transition(plans[0].run_id(), RunTransition::retry(&unavailable()))
                .await
                .unwrap();
        }
        for _ in 0..2 {
            previous.record_attempt(plans[1].run_id()).await.unwrap();
            previous
                .transition(plans[1].run_id(), RunTransition::retry(&unavailable()))
                .await
                .unwrap();
        }
        previous.record_attempt(plans[1].run_id()).await.unwrap();
        previous.record_attempt(plans[2].run_id()).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        previous.snapshot_to(&path).unwrap();

        let orchestrator = Orchestrator::new(
            Flaky::new(u32::MAX, unavailable),
            Arc::new(MemoryRunRegistry::restore_from(&path).unwrap()),
            Arc::new(MetricsAggregator::new()),
            config(2, 2),
        );
        let mut events = orchestrator.subscribe();
        let report = orchestrator.run_batch(&grid).await.unwrap();

        assert!(report.runs().iter().all(|r| r.attempt_count() <= 3));
        assert!(report.runs().iter().all(|r| r.state() == RunState::Failed));
        // only the run with budget left executed again, twice
        assert_eq!(orchestrator.shared.executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.runs()[2].attempt_count(), 3);

        let kinds: Vec<ErrorKind> = report.failures().iter().map(|f| f.error_kind).collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::DataUnavailable, ErrorKind::Internal, ErrorKind::DataUnavailable]
        );

        let mut terminal = 0;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.state, RunState::Failed);
            terminal += 1;
        }
        assert_eq!(terminal, 3);
    }

    #[tokio::test]
    async fn test_second_batch_does_not_duplicate_metrics() {
        let orchestrator = orchestrator(Flaky::new(0, || Error::Other(String::new())), config(2, 0));
        let first = orchestrator.run_batch(&grid(1)).await.unwrap();
        assert_eq!(first.succeeded(), 4);
        assert_eq!(first.metrics().len(), 4);

        let mut events = orchestrator.subscribe();
        let second = orchestrator.run_batch(&grid(1)).await.unwrap();

        assert_eq!(second.runs().len(), 4);
        assert_eq!(second.succeeded(), 0);
        assert!(second.metrics().is_empty());
        assert_eq!(second.failures().len(), 4);
        assert!(second
            .failures()
            .iter()
            .all(|f| f.error_kind == ErrorKind::Internal && f.detail.contains("already recorded")));
        assert_eq!(orchestrator.shared.executor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(orchestrator.aggregator().len(), 4);

        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.state, RunState::Failed);
            failed += 1;
        }
        assert_eq!(failed, 4);
    }

    #[test]
    fn test_backoff_delay() {
        let config = OrchestratorConfig {
            worker_limit: 1,
            retry_budget: 3,
            backoff_ms: 10,
        };
        assert_eq!(backoff_delay(&config, ErrorKind::DataUnavailable, 3), Duration::from_millis(10));
        assert_eq!(backoff_delay(&config, ErrorKind::DeadlineExceeded, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(&config, ErrorKind::DeadlineExceeded, 3), Duration::from_millis(40));
        assert_eq!(
            backoff_delay(&config, ErrorKind::DeadlineExceeded, 50),
            Duration::from_millis(10 * 1024)
        );
    }
}
