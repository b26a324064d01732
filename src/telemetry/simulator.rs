//! Simulator collaborator interface and its synthetic reference form.

use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHasher;

use crate::experiment::RunPlan;
use crate::{Error, Result};

/// One raw reading from the simulator: the applied control input and the
/// noise-free linear response of the plant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalPoint {
    /// Control input applied at this tick.
    pub control: f64,
    /// Plant response before complexity shaping and sensor noise.
    pub response: f64,
}

/// Opaque source of raw signal points for one run.
///
/// The collector paces the session and applies noise and complexity shaping
/// on top of whatever the source returns.
pub trait SignalSource: Send + Sync + 'static {
    /// Per-run cursor over the signal.
    type Session: SignalSession;

    /// Open a session for one run attempt.
    ///
    /// # Errors
    ///
    /// Returns `SimulationFailure` if the simulator cannot start.
    fn open(&self, plan: &RunPlan) -> Result<Self::Session>;
}

/// Cursor over one run's raw signal.
pub trait SignalSession: Send + 'static {
    /// Produce the next point.
    ///
    /// # Errors
    ///
    /// Returns `SimulationFailure` if the simulator crashed.
    fn next_point(&mut self) -> Result<SignalPoint>;
}

/// Synthetic plant `response = 2·control + 5` driven by uniform control
/// inputs in `[0, 10)`.
///
/// Control inputs depend only on the seed and the repetition index, so runs
/// that differ only in noise level see identical inputs.
#[derive(Debug, Clone)]
pub struct SyntheticSimulator {
    seed: u64,
    crash_after: Option<u64>,
}

impl SyntheticSimulator {
    /// True slope of the plant.
    pub const COEFFICIENT: f64 = 2.0;
    /// True offset of the plant.
    pub const INTERCEPT: f64 = 5.0;
    /// Upper bound (exclusive) of the control input.
    pub const CONTROL_MAX: f64 = 10.0;

    /// Create a simulator with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            crash_after: None,
        }
    }

    /// Make every session crash after emitting `points` points.
    #[must_use]
    pub const fn with_crash_after(mut self, points: u64) -> Self {
        self.crash_after = Some(points);
        self
    }

    /// Seed used by this simulator.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }
}

impl SignalSource for SyntheticSimulator {
    type Session = SyntheticSession;

    fn open(&self, plan: &RunPlan) -> Result<SyntheticSession> {
        Ok(SyntheticSession {
            rng: StdRng::seed_from_u64(derive_seed(self.seed, &plan.repetition())),
            crash_after: self.crash_after,
            emitted: 0,
        })
    }
}

/// Session of a [`SyntheticSimulator`].
#[derive(Debug)]
pub struct SyntheticSession {
    rng: StdRng,
    crash_after: Option<u64>,
    emitted: u64,
}

impl SignalSession for SyntheticSession {
    fn next_point(&mut self) -> Result<SignalPoint> {
        if self.crash_after.is_some_and(|limit| self.emitted >= limit) {
            return Err(Error::SimulationFailure(format!(
                "simulator crashed after {} points",
                self.emitted
            )));
        }
        self.emitted += 1;
        let control = self.rng.gen_range(0.0..SyntheticSimulator::CONTROL_MAX);
        Ok(SignalPoint {
            control,
            response: SyntheticSimulator::COEFFICIENT.mul_add(control, SyntheticSimulator::INTERCEPT),
        })
    }
}

/// Mix a base seed with any hashable salt (stable across processes).
pub(crate) fn derive_seed<T: Hash + ?Sized>(seed: u64, salt: &T) -> u64 {
    let mut hasher = FxHasher::default();
    seed.hash(&mut hasher);
    salt.hash(&mut hasher);
    hasher.finish()
}
