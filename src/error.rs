//! Error types for Gemelo
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Every failure a run can hit maps onto an [`ErrorKind`]. The orchestrator
//! only looks at the kind to decide between retrying and terminating a run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Gemelo error types
#[derive(Error, Debug)]
pub enum Error {
    /// Telemetry collector or simulator crashed (retryable)
    #[error("Simulation failure: {0}")]
    SimulationFailure(String),

    /// Virtual table lookup timed out or the source is down (retryable)
    #[error("Data unavailable from '{table}': {reason}")]
    DataUnavailable {
        /// Logical table or stream name
        table: String,
        /// Timeout or outage description
        reason: String,
    },

    /// Model missed its latency budget (retryable with backoff)
    #[error("Deadline exceeded: {operation} did not finish within {budget_ms} ms")]
    DeadlineExceeded {
        /// Operation that missed the deadline (`fit` or `predict`)
        operation: String,
        /// Budget in milliseconds
        budget_ms: u64,
    },

    /// Run registry consistency violation (fatal, never retried)
    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        /// Run identifier
        run_id: String,
        /// State the run was in
        from: String,
        /// Requested state
        to: String,
    },

    /// Degenerate training data; retrying reproduces the same failure
    #[error("Model fit failed: {0}")]
    ModelFitFailure(String),

    /// Run was cancelled by the orchestrator or the caller
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Unknown run id
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Second metrics record for the same run (append-only result set)
    #[error("Metrics already recorded for run {0}")]
    DuplicateMetrics(String),

    /// Fused window violates its scenario/time-span invariant
    #[error("Invalid fused window: {0}")]
    InvalidWindow(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Virtual table query parsing error
    #[error("SQL parse error: {0}")]
    ParseError(String),

    /// Storage error (Parquet/Arrow)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], stored on failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Collector or simulator crash
    SimulationFailure,
    /// Gateway timeout or outage
    DataUnavailable,
    /// Model missed its deadline
    DeadlineExceeded,
    /// Registry consistency violation
    InvalidTransition,
    /// Degenerate training data
    ModelFitFailure,
    /// Cancelled run
    Cancelled,
    /// Anything else (configuration, storage, IO, ...)
    Internal,
}

impl ErrorKind {
    /// Transient kinds are retried by the orchestrator up to the retry budget.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SimulationFailure | Self::DataUnavailable | Self::DeadlineExceeded
        )
    }

    /// Get kind name as string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SimulationFailure => "simulation_failure",
            Self::DataUnavailable => "data_unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::InvalidTransition => "invalid_transition",
            Self::ModelFitFailure => "model_fit_failure",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SimulationFailure(_) => ErrorKind::SimulationFailure,
            Self::DataUnavailable { .. } => ErrorKind::DataUnavailable,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::ModelFitFailure(_) => ErrorKind::ModelFitFailure,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub(crate) fn deadline(operation: &str, budget: std::time::Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.to_string(),
            budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
