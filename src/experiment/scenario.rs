//! Scenarios - one experimental condition and the grid that enumerates them

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// What a run does when the virtual data gateway cannot deliver rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialDataPolicy {
    /// Fail the attempt with `DataUnavailable` (retried as transient).
    #[default]
    Abort,
    /// Continue with whatever rows arrived and flag the metrics as partial.
    ProceedWithPartial,
}

/// Immutable description of one experimental condition.
///
/// Identity is the parameter tuple `(complexity, noise, latency, resource flag)`;
/// the repetition count and partial-data policy are execution settings and do
/// not take part in the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    complexity: u8,
    noise_level: f64,
    latency_ms: u64,
    resource_constrained: bool,
    repetitions: u32,
    partial_data: PartialDataPolicy,
}

impl ScenarioSpec {
    /// Create a scenario with no injected latency, no resource constraint,
    /// a single repetition and the `Abort` partial-data policy.
    #[must_use]
    pub const fn new(complexity: u8, noise_level: f64) -> Self {
        Self {
            complexity,
            noise_level,
            latency_ms: 0,
            resource_constrained: false,
            repetitions: 1,
            partial_data: PartialDataPolicy::Abort,
        }
    }

    /// Set the injected network latency in milliseconds.
    #[must_use]
    pub const fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set the resource-constraint flag.
    #[must_use]
    pub const fn with_resource_constraint(mut self, constrained: bool) -> Self {
        self.resource_constrained = constrained;
        self
    }

    /// Set the number of repetitions.
    #[must_use]
    pub const fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Set the partial-data policy.
    #[must_use]
    pub const fn with_partial_data(mut self, policy: PartialDataPolicy) -> Self {
        self.partial_data = policy;
        self
    }

    /// Task complexity level (1 = linear dynamics, 2+ = quadratic component).
    #[must_use]
    pub const fn complexity(&self) -> u8 {
        self.complexity
    }

    /// Standard deviation of the Gaussian sensor noise.
    #[must_use]
    pub const fn noise_level(&self) -> f64 {
        self.noise_level
    }

    /// Injected network latency for external lookups.
    #[must_use]
    pub const fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    /// Whether the run executes under a resource constraint.
    #[must_use]
    pub const fn resource_constrained(&self) -> bool {
        self.resource_constrained
    }

    /// Number of repetitions of this scenario.
    #[must_use]
    pub const fn repetitions(&self) -> u32 {
        self.repetitions
    }

    /// Partial-data policy.
    #[must_use]
    pub const fn partial_data(&self) -> PartialDataPolicy {
        self.partial_data
    }

    /// Stable identifier rendered from the parameter tuple.
    ///
    /// ```rust
    /// use gemelo::experiment::ScenarioSpec;
    ///
    /// let spec = ScenarioSpec::new(2, 0.5).with_latency_ms(20);
    /// assert_eq!(spec.id(), "c2-n0.500-l20-r0");
    /// ```
    #[must_use]
    pub fn id(&self) -> String {
        format!(
            "c{}-n{:.3}-l{}-r{}",
            self.complexity,
            self.noise_level,
            self.latency_ms,
            u8::from(self.resource_constrained)
        )
    }

    /// Lexicographic order over the parameter tuple.
    #[must_use]
    pub fn cmp_params(&self, other: &Self) -> Ordering {
        self.complexity
            .cmp(&other.complexity)
            .then_with(|| self.noise_level.total_cmp(&other.noise_level))
            .then_with(|| self.latency_ms.cmp(&other.latency_ms))
            .then_with(|| self.resource_constrained.cmp(&other.resource_constrained))
    }

    /// Check the parameters are usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for complexity 0, a negative or non-finite noise
    /// level, or zero repetitions.
    pub fn validate(&self) -> Result<()> {
        if self.complexity == 0 {
            return Err(Error::InvalidInput("complexity must be >= 1".to_string()));
        }
        if !self.noise_level.is_finite() || self.noise_level < 0.0 {
            return Err(Error::InvalidInput(format!(
                "noise level must be finite and non-negative, got {}",
                self.noise_level
            )));
        }
        if self.repetitions == 0 {
            return Err(Error::InvalidInput(format!(
                "scenario {} has zero repetitions",
                self.id()
            )));
        }
        Ok(())
    }
}

/// One schedulable unit of work: a scenario repetition with its run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    run_id: String,
    scenario: ScenarioSpec,
    repetition: u32,
}

impl RunPlan {
    /// Create a plan; the run id is derived from the scenario id and repetition.
    #[must_use]
    pub fn new(scenario: ScenarioSpec, repetition: u32) -> Self {
        Self {
            run_id: format!("{}-rep{repetition:03}", scenario.id()),
            scenario,
            repetition,
        }
    }

    /// Deterministic run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Scenario this run executes.
    #[must_use]
    pub const fn scenario(&self) -> &ScenarioSpec {
        &self.scenario
    }

    /// Zero-based repetition index.
    #[must_use]
    pub const fn repetition(&self) -> u32 {
        self.repetition
    }
}

/// The full, de-duplicated set of scenarios for one experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioGrid {
    scenarios: Vec<ScenarioSpec>,
}

impl ScenarioGrid {
    /// Start building a cartesian grid.
    #[must_use]
    pub fn builder() -> ScenarioGridBuilder {
        ScenarioGridBuilder::default()
    }

    /// Build a grid from an explicit list of scenarios.
    ///
    /// Scenarios are sorted by parameter tuple; duplicates keep the first entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if any scenario fails validation, or if two
    /// distinct parameter tuples render to the same id (noise levels closer
    /// than the id's three decimals).
    pub fn from_specs(specs: impl IntoIterator<Item = ScenarioSpec>) -> Result<Self> {
        let mut scenarios: Vec<ScenarioSpec> = specs.into_iter().collect();
        for spec in &scenarios {
            spec.validate()?;
        }
        scenarios.sort_by(ScenarioSpec::cmp_params);
        scenarios.dedup_by(|b, a| a.cmp_params(b) == Ordering::Equal);

        let mut seen: HashMap<String, f64> = HashMap::with_capacity(scenarios.len());
        for spec in &scenarios {
            if let Some(other) = seen.insert(spec.id(), spec.noise_level()) {
                return Err(Error::InvalidInput(format!(
                    "noise levels {other} and {} share scenario id {}",
                    spec.noise_level(),
                    spec.id()
                )));
            }
        }
        Ok(Self { scenarios })
    }

    /// Design space of the original alignment study:
    /// noise {0.5, 1.0} x complexity {1, 2}.
    #[must_use]
    pub fn study_default() -> Self {
        let specs = [1u8, 2]
            .into_iter()
            .flat_map(|c| [0.5, 1.0].into_iter().map(move |n| ScenarioSpec::new(c, n)))
            .collect();
        Self { scenarios: specs }
    }

    /// Scenarios in lexicographic parameter order.
    #[must_use]
    pub fn scenarios(&self) -> &[ScenarioSpec] {
        &self.scenarios
    }

    /// Number of distinct scenarios.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// Whether the grid has no scenarios.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Total number of runs (sum of repetitions).
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.scenarios.iter().map(|s| s.repetitions() as usize).sum()
    }

    /// Enumerate every run: parameter tuple order, then repetition index.
    ///
    /// The same grid always yields the same run ids in the same order.
    #[must_use]
    pub fn runs(&self) -> Vec<RunPlan> {
        self.scenarios
            .iter()
            .flat_map(|spec| (0..spec.repetitions()).map(move |rep| RunPlan::new(spec.clone(), rep)))
            .collect()
    }
}

/// Builder for a cartesian [`ScenarioGrid`].
///
/// Axes left unset default to complexity `[1]`, noise `[0.0]`, latency `[0]`
/// and resource constraint `[false]`.
#[derive(Debug, Default)]
pub struct ScenarioGridBuilder {
    complexities: Vec<u8>,
    noise_levels: Vec<f64>,
    latencies_ms: Vec<u64>,
    resource_constraints: Vec<bool>,
    repetitions: Option<u32>,
    partial_data: PartialDataPolicy,
}

impl ScenarioGridBuilder {
    /// Complexity levels to cross.
    #[must_use]
    pub fn complexities(mut self, levels: impl IntoIterator<Item = u8>) -> Self {
        self.complexities = levels.into_iter().collect();
        self
    }

    /// Noise levels to cross.
    #[must_use]
    pub fn noise_levels(mut self, levels: impl IntoIterator<Item = f64>) -> Self {
        self.noise_levels = levels.into_iter().collect();
        self
    }

    /// Injected latencies (ms) to cross.
    #[must_use]
    pub fn latencies_ms(mut self, latencies: impl IntoIterator<Item = u64>) -> Self {
        self.latencies_ms = latencies.into_iter().collect();
        self
    }

    /// Resource-constraint flags to cross.
    #[must_use]
    pub fn resource_constraints(mut self, flags: impl IntoIterator<Item = bool>) -> Self {
        self.resource_constraints = flags.into_iter().collect();
        self
    }

    /// Repetitions per scenario.
    #[must_use]
    pub const fn repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = Some(repetitions);
        self
    }

    /// Partial-data policy applied to every scenario of the grid.
    #[must_use]
    pub const fn partial_data(mut self, policy: PartialDataPolicy) -> Self {
        self.partial_data = policy;
        self
    }

    /// Build the grid.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a resulting scenario fails validation.
    pub fn build(self) -> Result<ScenarioGrid> {
        fn or_default<T: Clone>(axis: Vec<T>, default: T) -> Vec<T> {
            if axis.is_empty() {
                vec![default]
            } else {
                axis
            }
        }

        let complexities = or_default(self.complexities, 1);
        let noise_levels = or_default(self.noise_levels, 0.0);
        let latencies = or_default(self.latencies_ms, 0);
        let constraints = or_default(self.resource_constraints, false);
        let repetitions = self.repetitions.unwrap_or(1);

        let mut specs = Vec::new();
        for &complexity in &complexities {
            for &noise in &noise_levels {
                for &latency in &latencies {
                    for &constrained in &constraints {
                        specs.push(
                            ScenarioSpec::new(complexity, noise)
                                .with_latency_ms(latency)
                                .with_resource_constraint(constrained)
                                .with_repetitions(repetitions)
                                .with_partial_data(self.partial_data),
                        );
                    }
                }
            }
        }

        ScenarioGrid::from_specs(specs)
    }
}
