//! Experiment configuration
//!
//! Loaded from JSON (every field optional, missing fields take defaults) and
//! then overridden from `GEMELO_*` environment variables:
//!
//! - `GEMELO_WORKER_LIMIT`
//! - `GEMELO_RETRY_BUDGET`
//! - `GEMELO_BACKOFF_MS`
//! - `GEMELO_SAMPLING_RATE_HZ`
//! - `GEMELO_DURATION_MS`
//! - `GEMELO_WINDOW_SIZE`
//! - `GEMELO_GATEWAY_TABLE`
//! - `GEMELO_GATEWAY_TIMEOUT_MS`
//! - `GEMELO_FIT_DEADLINE_MS`
//! - `GEMELO_PREDICT_DEADLINE_MS`
//! - `GEMELO_SLA_MS`
//! - `GEMELO_SEED`

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Telemetry sampling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Samples per second.
    pub rate_hz: u32,
    /// Length of one run's sampling phase.
    pub duration_ms: u64,
    /// Samples per fused window.
    pub window_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate_hz: 10,
            duration_ms: 10_000,
            window_size: 10,
        }
    }
}

impl SamplingConfig {
    /// Interval between two samples.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate_hz.max(1)))
    }

    /// Number of samples one run produces.
    ///
    /// Saturates at `u64::MAX / 1000` for durations whose sample count does
    /// not fit; `validate` rejects those.
    #[must_use]
    pub fn samples_per_run(&self) -> u64 {
        self.duration_ms.saturating_mul(u64::from(self.rate_hz)) / 1000
    }

    /// Number of join buckets (fused windows) one run spans.
    #[must_use]
    pub fn buckets_per_run(&self) -> u64 {
        self.samples_per_run().div_ceil(self.window_size.max(1) as u64)
    }
}

/// Virtual data gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Logical table joined against telemetry.
    pub table: String,
    /// Lookup timeout.
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            table: "enterprise_context".to_string(),
            timeout_ms: 200,
        }
    }
}

impl GatewayConfig {
    /// Lookup timeout as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// World model settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Seed shared by the simulator and `fit`.
    pub seed: u64,
    /// Budget for one `fit` call.
    pub fit_deadline_ms: u64,
    /// Budget for one `predict` call.
    pub predict_deadline_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            fit_deadline_ms: 2_000,
            predict_deadline_ms: 100,
        }
    }
}

impl ModelConfig {
    /// `fit` budget as a `Duration`.
    #[must_use]
    pub const fn fit_deadline(&self) -> Duration {
        Duration::from_millis(self.fit_deadline_ms)
    }

    /// `predict` budget as a `Duration`.
    #[must_use]
    pub const fn predict_deadline(&self) -> Duration {
        Duration::from_millis(self.predict_deadline_ms)
    }
}

/// Scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of concurrently executing runs.
    pub worker_limit: usize,
    /// Retries per run after the first attempt.
    pub retry_budget: u32,
    /// Base backoff between attempts.
    pub backoff_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            retry_budget: 2,
            backoff_ms: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Base backoff as a `Duration`.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Complete configuration of one experiment batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Telemetry sampling.
    pub sampling: SamplingConfig,
    /// External data lookups.
    pub gateway: GatewayConfig,
    /// World model.
    pub model: ModelConfig,
    /// Scheduling and retries.
    pub orchestrator: OrchestratorConfig,
    /// End-to-end budget for the predict-then-join path of one run.
    pub sla_ms: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            gateway: GatewayConfig::default(),
            model: ModelConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            sla_ms: 500,
        }
    }
}

impl ExperimentConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Defaults overridden by the environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `GEMELO_*` environment overrides on top of this configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is present but cannot be parsed.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// SLA budget as a `Duration`.
    #[must_use]
    pub const fn sla(&self) -> Duration {
        Duration::from_millis(self.sla_ms)
    }

    /// Check the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns `Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.worker_limit == 0 {
            return Err(Error::Config("worker_limit must be >= 1".to_string()));
        }
        if self.sampling.rate_hz == 0 {
            return Err(Error::Config("sampling rate must be >= 1 Hz".to_string()));
        }
        if self.sampling.window_size == 0 {
            return Err(Error::Config("window_size must be >= 1".to_string()));
        }
        if self
            .sampling
            .duration_ms
            .checked_mul(u64::from(self.sampling.rate_hz))
            .is_none()
        {
            return Err(Error::Config(format!(
                "{} ms at {} Hz overflows the sample counter",
                self.sampling.duration_ms, self.sampling.rate_hz
            )));
        }
        if self.sampling.samples_per_run() < 2 {
            return Err(Error::Config(format!(
                "{} ms at {} Hz yields fewer than 2 samples",
                self.sampling.duration_ms, self.sampling.rate_hz
            )));
        }
        if self.gateway.timeout_ms > self.sla_ms {
            return Err(Error::Config(format!(
                "gateway timeout {} ms exceeds the {} ms SLA",
                self.gateway.timeout_ms, self.sla_ms
            )));
        }
        Ok(())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(name).and_then(|v| {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
        };

        if let Some(v) = parse_var(&get, "GEMELO_WORKER_LIMIT")? {
            self.orchestrator.worker_limit = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_RETRY_BUDGET")? {
            self.orchestrator.retry_budget = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_BACKOFF_MS")? {
            self.orchestrator.backoff_ms = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_SAMPLING_RATE_HZ")? {
            self.sampling.rate_hz = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_DURATION_MS")? {
            self.sampling.duration_ms = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_WINDOW_SIZE")? {
            self.sampling.window_size = v;
        }
        if let Some(v) = get("GEMELO_GATEWAY_TABLE") {
            self.gateway.table = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_GATEWAY_TIMEOUT_MS")? {
            self.gateway.timeout_ms = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_FIT_DEADLINE_MS")? {
            self.model.fit_deadline_ms = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_PREDICT_DEADLINE_MS")? {
            self.model.predict_deadline_ms = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_SLA_MS")? {
            self.sla_ms = v;
        }
        if let Some(v) = parse_var(&get, "GEMELO_SEED")? {
            self.model.seed = v;
        }
        Ok(self)
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = get(name) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ExperimentConfig::default();
        assert_eq!(config.sampling.rate_hz, 10);
        assert_eq!(config.sla_ms, 500);
        assert_eq!(config.sampling.samples_per_run(), 100);
        assert_eq!(config.sampling.buckets_per_run(), 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ExperimentConfig =
            serde_json::from_str(r#"{"orchestrator": {"worker_limit": 8}, "sla_ms": 750}"#).unwrap();
        assert_eq!(config.orchestrator.worker_limit, 8);
        assert_eq!(config.orchestrator.retry_budget, 2);
        assert_eq!(config.sla_ms, 750);
        assert_eq!(config.gateway.table, "enterprise_context");
    }

    #[test]
    fn test_env_overrides() {
        let config = ExperimentConfig::default()
            .with_overrides(lookup_from(&[
                ("GEMELO_WORKER_LIMIT", "2"),
                ("GEMELO_SAMPLING_RATE_HZ", " 100 "),
                ("GEMELO_GATEWAY_TABLE", "erp_orders"),
                ("GEMELO_SEED", ""),
            ]))
            .unwrap();
        assert_eq!(config.orchestrator.worker_limit, 2);
        assert_eq!(config.sampling.rate_hz, 100);
        assert_eq!(config.gateway.table, "erp_orders");
        assert_eq!(config.model.seed, 42);
    }

    #[test]
    fn test_env_override_parse_error() {
        let err = ExperimentConfig::default()
            .with_overrides(lookup_from(&[("GEMELO_RETRY_BUDGET", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("GEMELO_RETRY_BUDGET"));
    }

    #[test]
    fn test_validate_rejects_inconsistent_config() {
        let mut config = ExperimentConfig::default();
        config.orchestrator.worker_limit = 0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.gateway.timeout_ms = 900;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.sampling.duration_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_count_overflow() {
        let mut config = ExperimentConfig::default();
        config.sampling.duration_ms = u64::MAX / 2;
        config.sampling.rate_hz = 1_000;
        assert_eq!(config.sampling.samples_per_run(), u64::MAX / 1000);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        std::fs::write(&path, r#"{"sampling": {"rate_hz": 50, "duration_ms": 2000}}"#).unwrap();

        let config = ExperimentConfig::from_json_file(&path).unwrap();
        assert_eq!(config.sampling.samples_per_run(), 100);
        assert_eq!(config.sampling.window_size, 10);

        let missing = ExperimentConfig::from_json_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
