//! Run Record - lifecycle of one scenario repetition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::{Error, Result};

/// Lifecycle state of a run.
///
/// ```text
/// Pending ──> Running ──> Succeeded
///    │          │  ▲
///    │          │  └──── Retrying ──> Failed | Cancelled
///    │          ├──> Failed
///    └──────────┴──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Scheduled but not yet started.
    Pending,
    /// An attempt is executing.
    Running,
    /// Last attempt failed transiently; another attempt is queued.
    Retrying,
    /// Completed successfully (terminal).
    Succeeded,
    /// Failed permanently (terminal).
    Failed,
    /// Cancelled before completion (terminal).
    Cancelled,
}

impl RunState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                target,
                Self::Succeeded | Self::Failed | Self::Retrying | Self::Cancelled
            ),
            Self::Retrying => matches!(target, Self::Running | Self::Failed | Self::Cancelled),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A requested change to a run, applied atomically by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RunTransition {
    /// Begin a new attempt (`Pending|Retrying -> Running`).
    Start,
    /// Attempt succeeded (`Running -> Succeeded`).
    Succeed {
        /// Samples collected by the successful attempt.
        sample_count: u64,
    },
    /// Attempt failed transiently, another will follow (`Running -> Retrying`).
    Retry {
        /// Kind of the failure.
        kind: ErrorKind,
        /// Rendered error.
        detail: String,
    },
    /// Run failed permanently.
    Fail {
        /// Final error kind.
        kind: ErrorKind,
        /// Rendered error.
        detail: String,
    },
    /// Run was cancelled.
    Cancel {
        /// Why it was cancelled.
        detail: String,
    },
}

impl RunTransition {
    /// Build a `Retry` transition from an error.
    #[must_use]
    pub fn retry(error: &Error) -> Self {
        Self::Retry {
            kind: error.kind(),
            detail: error.to_string(),
        }
    }

    /// Build a `Fail` transition from an error.
    #[must_use]
    pub fn fail(error: &Error) -> Self {
        Self::Fail {
            kind: error.kind(),
            detail: error.to_string(),
        }
    }

    /// State this transition moves the run into.
    #[must_use]
    pub const fn target(&self) -> RunState {
        match self {
            Self::Start => RunState::Running,
            Self::Succeed { .. } => RunState::Succeeded,
            Self::Retry { .. } => RunState::Retrying,
            Self::Fail { .. } => RunState::Failed,
            Self::Cancel { .. } => RunState::Cancelled,
        }
    }
}

/// One execution attempt of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    attempt: u32,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    error_kind: Option<ErrorKind>,
}

impl AttemptRecord {
    /// One-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the attempt started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the attempt ended, if it has.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Error that ended the attempt, if any.
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }
}

/// Run Record represents one execution of a scenario repetition.
///
/// Owned by the orchestrator until terminal; read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    run_id: String,
    scenario_id: String,
    repetition: u32,
    state: RunState,
    attempts: Vec<AttemptRecord>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    sample_count: u64,
    error_kind: Option<ErrorKind>,
    error_detail: Option<String>,
}

impl RunRecord {
    /// Create a new run record in Pending state.
    #[must_use]
    pub fn new(run_id: impl Into<String>, scenario_id: impl Into<String>, repetition: u32) -> Self {
        Self {
            run_id: run_id.into(),
            scenario_id: scenario_id.into(),
            repetition,
            state: RunState::Pending,
            attempts: Vec::new(),
            started_at: None,
            ended_at: None,
            sample_count: 0,
            error_kind: None,
            error_detail: None,
        }
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

    /// Get the repetition index.
    #[must_use]
    pub const fn repetition(&self) -> u32 {
        self.repetition
    }

    /// Get the current state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// All attempts, oldest first.
    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// Number of attempts made so far.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Get the start timestamp of the first attempt.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the end timestamp, once terminal.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Samples collected by the successful attempt.
    #[must_use]
    pub const fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Final error kind for failed or cancelled runs.
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Final error message for failed or cancelled runs.
    #[must_use]
    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// Apply a transition, validating it against the state machine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the move is not allowed from the current
    /// state. Terminal states accept no transitions at all.
    pub fn apply(&mut self, transition: RunTransition) -> Result<()> {
        let target = transition.target();
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }

        let now = Utc::now();
        match transition {
            RunTransition::Start => {
                let attempt = self.attempt_count() + 1;
                self.attempts.push(AttemptRecord {
                    attempt,
                    started_at: now,
                    ended_at: None,
                    error_kind: None,
                });
                self.started_at.get_or_insert(now);
            }
            RunTransition::Succeed { sample_count } => {
                self.close_attempt(now, None);
                self.sample_count = sample_count;
                self.ended_at = Some(now);
            }
            RunTransition::Retry { kind, .. } => {
                self.close_attempt(now, Some(kind));
            }
            RunTransition::Fail { kind, detail } => {
                self.close_attempt(now, Some(kind));
                self.error_kind = Some(kind);
                self.error_detail = Some(detail);
                self.ended_at = Some(now);
            }
            RunTransition::Cancel { detail } => {
                self.close_attempt(now, Some(ErrorKind::Cancelled));
                self.error_kind = Some(ErrorKind::Cancelled);
                self.error_detail = Some(detail);
                self.ended_at = Some(now);
            }
        }

        self.state = target;
        Ok(())
    }

    /// Park a non-terminal run for resumption after a restart.
    ///
    /// An attempt still open is closed as `Internal`. Runs that never started
    /// go back to `Pending`; runs with attempts on record go to `Retrying`,
    /// so the attempts they already spent keep counting against the budget.
    pub(crate) fn reset_for_resume(&mut self) {
        if !self.state.is_terminal() {
            let now = Utc::now();
            self.close_attempt(now, Some(ErrorKind::Internal));
            self.state = if self.attempts.is_empty() {
                RunState::Pending
            } else {
                RunState::Retrying
            };
        }
    }

    /// Error kind of the most recent closed attempt.
    #[must_use]
    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.attempts.last().and_then(AttemptRecord::error_kind)
    }

    fn close_attempt(&mut self, now: DateTime<Utc>, error_kind: Option<ErrorKind>) {
        if let Some(last) = self.attempts.last_mut() {
            if last.ended_at.is_none() {
                last.ended_at = Some(now);
                last.error_kind = error_kind;
            }
        }
    }
}
