//! Telemetry Collector
//!
//! Turns a [`SignalSource`] into a lazy, paced, cancellable stream of
//! [`Sample`]s for one run.
//!
//! - A producer task ticks at the configured rate and sends over a bounded
//!   channel, so a slow consumer back-pressures the simulator.
//! - The collector shapes the raw signal: a quadratic term for complexity
//!   2 and above, Gaussian sensor noise scaled by the scenario's noise level.
//! - Cancelling stops production within one sampling interval; the stream
//!   then yields `Error::Cancelled`.

mod simulator;

pub use simulator::{SignalPoint, SignalSession, SignalSource, SyntheticSimulator, SyntheticSession};

pub(crate) use simulator::derive_seed;

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::config::SamplingConfig;
use crate::experiment::RunPlan;
use crate::{Error, Result};

/// Weight of the quadratic component for complexity >= 2.
pub const QUADRATIC_WEIGHT: f64 = 0.3;

/// Load multiplier applied to force under a resource constraint.
pub const CONSTRAINED_LOAD_FACTOR: f64 = 1.5;

/// One telemetry reading. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    scenario_id: String,
    seq: u64,
    timestamp_us: u64,
    control: f64,
    position: f64,
    velocity: f64,
    force: f64,
}

impl Sample {
    /// Create a sample. Mostly useful for tests and replay.
    #[must_use]
    pub fn new(
        scenario_id: impl Into<String>,
        seq: u64,
        timestamp_us: u64,
        control: f64,
        position: f64,
    ) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            seq,
            timestamp_us,
            control,
            position,
            velocity: 0.0,
            force: control,
        }
    }

    /// Scenario-condition tag.
    #[must_use]
    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Zero-based index within the run.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Offset from the start of the run in microseconds.
    #[must_use]
    pub const fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Control input.
    #[must_use]
    pub const fn control(&self) -> f64 {
        self.control
    }

    /// Observed position (shaped and noisy).
    #[must_use]
    pub const fn position(&self) -> f64 {
        self.position
    }

    /// Finite-difference velocity, units per second.
    #[must_use]
    pub const fn velocity(&self) -> f64 {
        self.velocity
    }

    /// Applied force.
    #[must_use]
    pub const fn force(&self) -> f64 {
        self.force
    }
}

/// Spawns per-run sampling tasks.
pub struct TelemetryCollector<S> {
    source: Arc<S>,
    sampling: SamplingConfig,
    seed: u64,
}

impl<S> Clone for TelemetryCollector<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            sampling: self.sampling.clone(),
            seed: self.seed,
        }
    }
}

impl<S: SignalSource> TelemetryCollector<S> {
    /// Create a collector over `source`; `seed` drives the sensor noise.
    #[must_use]
    pub fn new(source: Arc<S>, sampling: SamplingConfig, seed: u64) -> Self {
        Self {
            source,
            sampling,
            seed,
        }
    }

    /// Sampling settings.
    #[must_use]
    pub const fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    /// Start sampling one run.
    ///
    /// Must be called from within a tokio runtime. Errors (including a
    /// simulator that fails to open) are delivered through the stream.
    #[must_use]
    pub fn start(&self, plan: &RunPlan, cancel: CancelSignal) -> SampleStream {
        let expected = self.sampling.samples_per_run();
        let capacity = self.sampling.window_size.max(1) * 2;
        let (tx, rx) = mpsc::channel(capacity);

        let producer = Producer {
            scenario_id: plan.scenario().id(),
            complexity: plan.scenario().complexity(),
            noise_level: plan.scenario().noise_level(),
            load_factor: if plan.scenario().resource_constrained() {
                CONSTRAINED_LOAD_FACTOR
            } else {
                1.0
            },
            rate_hz: self.sampling.rate_hz.max(1),
            expected,
        };
        let session = self.source.open(plan);
        let noise_seed = derive_seed(self.seed, plan.run_id());
        let interval = self.sampling.interval();
        let run_id = plan.run_id().to_string();

        let task = tokio::spawn(async move {
            let result = match session {
                Ok(session) => producer.run(session, noise_seed, interval, &tx, &cancel).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                debug!(run_id = %run_id, error = %e, "telemetry producer stopped");
                // the consumer may already be gone
                let _ = tx.send(Err(e)).await;
            }
        });

        SampleStream {
            rx,
            task,
            expected,
            received: 0,
        }
    }
}

struct Producer {
    scenario_id: String,
    complexity: u8,
    noise_level: f64,
    load_factor: f64,
    rate_hz: u32,
    expected: u64,
}

impl Producer {
    async fn run<T: SignalSession>(
        self,
        mut session: T,
        noise_seed: u64,
        interval: std::time::Duration,
        tx: &mpsc::Sender<Result<Sample>>,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let noise = Normal::new(0.0, self.noise_level)
            .map_err(|e| Error::InvalidInput(format!("noise level {}: {e}", self.noise_level)))?;
        let mut rng = StdRng::seed_from_u64(noise_seed);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let rate = f64::from(self.rate_hz);
        let mut previous: Option<f64> = None;

        for seq in 0..self.expected {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(seq)),
                _ = ticker.tick() => {}
            }

            let point = session.next_point()?;
            let mut position = point.response;
            if self.complexity >= 2 {
                position += QUADRATIC_WEIGHT * point.control * point.control;
            }
            position += noise.sample(&mut rng);

            let velocity = previous.map_or(0.0, |prev| (position - prev) * rate);
            previous = Some(position);

            let sample = Sample {
                scenario_id: self.scenario_id.clone(),
                seq,
                timestamp_us: seq * 1_000_000 / u64::from(self.rate_hz),
                control: point.control,
                position,
                velocity,
                force: point.control * self.load_factor,
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(seq)),
                sent = tx.send(Ok(sample)) => {
                    if sent.is_err() {
                        // consumer dropped the stream
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

fn cancelled(seq: u64) -> Error {
    Error::Cancelled(format!("telemetry stopped at sample {seq}"))
}

/// Receiving end of one run's samples.
///
/// Dropping the stream stops the producer.
pub struct SampleStream {
    rx: mpsc::Receiver<Result<Sample>>,
    task: JoinHandle<()>,
    expected: u64,
    received: u64,
}

impl SampleStream {
    /// Next sample, `None` once the run's duration is exhausted.
    ///
    /// A producer that disappears early (panic, abort) surfaces as
    /// `SimulationFailure` rather than a silently short stream.
    pub async fn next(&mut self) -> Option<Result<Sample>> {
        match self.rx.recv().await {
            Some(Ok(sample)) => {
                self.received += 1;
                Some(Ok(sample))
            }
            Some(Err(e)) => Some(Err(e)),
            None if self.received < self.expected => {
                warn!(
                    received = self.received,
                    expected = self.expected,
                    "telemetry producer ended early"
                );
                let received = self.received;
                self.received = self.expected;
                Some(Err(Error::SimulationFailure(format!(
                    "collector stopped after {received} of {} samples",
                    self.expected
                ))))
            }
            None => None,
        }
    }

    /// Drain the stream, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error the producer reported.
    pub async fn collect(mut self) -> Result<Vec<Sample>> {
        let capacity = usize::try_from(self.expected).unwrap_or(0);
        let mut samples = Vec::with_capacity(capacity);
        while let Some(sample) = self.next().await {
            samples.push(sample?);
        }
        Ok(samples)
    }

    /// Samples received so far.
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::experiment::ScenarioSpec;
    use std::time::{Duration, Instant};

    fn fast_sampling(samples: u64) -> SamplingConfig {
        SamplingConfig {
            rate_hz: 1_000,
            duration_ms: samples,
            window_size: 10,
        }
    }

    fn collector(samples: u64) -> TelemetryCollector<SyntheticSimulator> {
        TelemetryCollector::new(Arc::new(SyntheticSimulator::new(42)), fast_sampling(samples), 42)
    }

    #[tokio::test]
    async fn test_collects_expected_count_in_order() {
        let plan = RunPlan::new(ScenarioSpec::new(1, 0.5), 0);
        let samples = collector(50).start(&plan, CancelSignal::never()).collect().await.unwrap();

        assert_eq!(samples.len(), 50);
        for pair in samples.windows(2) {
            assert!(pair[0].timestamp_us() < pair[1].timestamp_us());
            assert_eq!(pair[0].seq() + 1, pair[1].seq());
        }
        assert!(samples.iter().all(|s| s.scenario_id() == plan.scenario().id()));
    }

    #[tokio::test]
    async fn test_zero_noise_linear_signal() {
        let plan = RunPlan::new(ScenarioSpec::new(1, 0.0), 0);
        let samples = collector(20).start(&plan, CancelSignal::never()).collect().await.unwrap();
        for s in &samples {
            assert!((s.position() - (2.0 * s.control() + 5.0)).abs() < 1e-9);
            assert!((s.force() - s.control()).abs() < 1e-12);
        }
        assert!(samples[0].velocity().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_complexity_two_adds_quadratic_term() {
        let plan = RunPlan::new(ScenarioSpec::new(2, 0.0).with_resource_constraint(true), 0);
        let samples = collector(20).start(&plan, CancelSignal::never()).collect().await.unwrap();
        for s in &samples {
            let expected = 2.0 * s.control() + 5.0 + 0.3 * s.control() * s.control();
            assert!((s.position() - expected).abs() < 1e-9);
            assert!((s.force() - 1.5 * s.control()).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_velocity_is_finite_difference() {
        let plan = RunPlan::new(ScenarioSpec::new(1, 0.2), 0);
        let samples = collector(10).start(&plan, CancelSignal::never()).collect().await.unwrap();
        let expected = (samples[1].position() - samples[0].position()) * 1_000.0;
        assert!((samples[1].velocity() - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_same_run_is_reproducible() {
        let plan = RunPlan::new(ScenarioSpec::new(2, 1.0), 1);
        let a = collector(30).start(&plan, CancelSignal::never()).collect().await.unwrap();
        let b = collector(30).start(&plan, CancelSignal::never()).collect().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_cancel_stops_within_one_interval() {
        let sampling = SamplingConfig {
            rate_hz: 20,
            duration_ms: 60_000,
            window_size: 10,
        };
        let collector = TelemetryCollector::new(Arc::new(SyntheticSimulator::new(42)), sampling, 42);
        let plan = RunPlan::new(ScenarioSpec::new(1, 0.5), 0);
        let handle = CancelHandle::new();
        let mut stream = collector.start(&plan, handle.signal());

        for _ in 0..3 {
            stream.next().await.unwrap().unwrap();
        }

        let cancelled_at = Instant::now();
        handle.cancel();
        let mut saw_cancel = false;
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                assert!(matches!(e, Error::Cancelled(_)));
                saw_cancel = true;
                break;
            }
        }
        assert!(saw_cancel);
        // interval is 50 ms
        assert!(cancelled_at.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_simulator_crash_surfaces() {
        let collector = TelemetryCollector::new(
            Arc::new(SyntheticSimulator::new(42).with_crash_after(5)),
            fast_sampling(20),
            42,
        );
        let plan = RunPlan::new(ScenarioSpec::new(1, 0.0), 0);
        let err = collector.start(&plan, CancelSignal::never()).collect().await.unwrap_err();
        assert!(matches!(err, Error::SimulationFailure(_)));
    }
}
