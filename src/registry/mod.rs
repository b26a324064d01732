//! Run Registry
//!
//! Single source of truth for run lifecycle state, keyed by run id.
//!
//! - Every state change goes through [`RunRegistry::transition`], which
//!   validates it against the [`RunState`](crate::experiment::RunState)
//!   machine atomically, so only one of several racing transitions out of
//!   `running` can win.
//! - The registry has an explicit lifecycle: `init` on batch start, `drain`
//!   on batch completion.
//!
//! # Example
//!
//! ```rust,no_run
//! use gemelo::experiment::{RunPlan, RunState, RunTransition, ScenarioSpec};
//! use gemelo::registry::{MemoryRunRegistry, RunRegistry};
//!
//! # async fn example() -> gemelo::Result<()> {
//! let registry = MemoryRunRegistry::new();
//! registry.init().await?;
//!
//! let plan = RunPlan::new(ScenarioSpec::new(1, 0.5), 0);
//! registry.register(&plan).await?;
//! assert_eq!(registry.record_attempt(plan.run_id()).await?, 1);
//! registry
//!     .transition(plan.run_id(), RunTransition::Succeed { sample_count: 100 })
//!     .await?;
//!
//! let records = registry.drain().await?;
//! assert_eq!(records[0].state(), RunState::Succeeded);
//! # Ok(())
//! # }
//! ```

mod memory;

pub use memory::MemoryRunRegistry;

use crate::experiment::{RunPlan, RunRecord, RunTransition};
use crate::Result;
use std::future::Future;

/// Durable store of run records.
///
/// Implementations must serialize concurrent transitions on the same run id.
/// The in-memory implementation is the reference; the contract does not
/// assume the state is lost on restart.
pub trait RunRegistry: Send + Sync {
    /// Open the registry for a new batch.
    ///
    /// Fails if a batch is already open.
    fn init(&self) -> impl Future<Output = Result<()>> + Send;

    /// Register a planned run in `Pending` state.
    ///
    /// Registering an id that already exists returns the existing record
    /// unchanged, so a restored registry resumes where it stopped.
    fn register(&self, plan: &RunPlan) -> impl Future<Output = Result<RunRecord>> + Send;

    /// Atomically apply a transition and return the updated record.
    ///
    /// Fails with `InvalidTransition` if the move is not allowed from the
    /// run's current state and with `RunNotFound` for unknown ids.
    fn transition(
        &self,
        run_id: &str,
        transition: RunTransition,
    ) -> impl Future<Output = Result<RunRecord>> + Send;

    /// Get a run by id.
    fn get(&self, run_id: &str) -> impl Future<Output = Result<RunRecord>> + Send;

    /// All runs of one scenario, ordered by repetition.
    fn runs_for_scenario(
        &self,
        scenario_id: &str,
    ) -> impl Future<Output = Result<Vec<RunRecord>>> + Send;

    /// Every run, ordered by run id.
    fn all(&self) -> impl Future<Output = Result<Vec<RunRecord>>> + Send;

    /// Close the batch and hand back every record.
    ///
    /// Fails with `InvalidInput` while any run is still non-terminal.
    fn drain(&self) -> impl Future<Output = Result<Vec<RunRecord>>> + Send;

    /// Start a new attempt and return its one-based number.
    fn record_attempt(&self, run_id: &str) -> impl Future<Output = Result<u32>> + Send {
        async move {
            let record = self.transition(run_id, RunTransition::Start).await?;
            Ok(record.attempt_count())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::experiment::{RunState, ScenarioSpec};
    use crate::Error;
    use std::sync::Arc;

    fn plan(complexity: u8, rep: u32) -> RunPlan {
        RunPlan::new(ScenarioSpec::new(complexity, 0.5), rep)
    }

    async fn open_registry() -> MemoryRunRegistry {
        let registry = MemoryRunRegistry::new();
        registry.init().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = open_registry().await;
        let p = plan(1, 0);

        let record = registry.register(&p).await.unwrap();
        assert_eq!(record.state(), RunState::Pending);

        let fetched = registry.get(p.run_id()).await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_get_unknown_run() {
        let registry = open_registry().await;
        let err = registry.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_register_requires_init() {
        let registry = MemoryRunRegistry::new();
        assert!(registry.register(&plan(1, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_double_init_fails() {
        let registry = open_registry().await;
        assert!(registry.init().await.is_err());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = open_registry().await;
        let p = plan(1, 0);
        registry.register(&p).await.unwrap();
        registry.record_attempt(p.run_id()).await.unwrap();

        let again = registry.register(&p).await.unwrap();
        assert_eq!(again.state(), RunState::Running);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_record_attempt_counts() {
        let registry = open_registry().await;
        let p = plan(1, 0);
        registry.register(&p).await.unwrap();

        assert_eq!(registry.record_attempt(p.run_id()).await.unwrap(), 1);
        registry
            .transition(
                p.run_id(),
                RunTransition::Retry {
                    kind: ErrorKind::DataUnavailable,
                    detail: "timeout".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(registry.record_attempt(p.run_id()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_terminal_write_is_single() {
        let registry = open_registry().await;
        let p = plan(1, 0);
        registry.register(&p).await.unwrap();
        registry.record_attempt(p.run_id()).await.unwrap();
        registry
            .transition(p.run_id(), RunTransition::Succeed { sample_count: 10 })
            .await
            .unwrap();

        let err = registry
            .transition(p.run_id(), RunTransition::Cancel { detail: "late".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_runs_for_scenario() {
        let registry = open_registry().await;
        for rep in [2, 0, 1] {
            registry.register(&plan(1, rep)).await.unwrap();
        }
        registry.register(&plan(2, 0)).await.unwrap();

        let scenario_id = ScenarioSpec::new(1, 0.5).id();
        let runs = registry.runs_for_scenario(&scenario_id).await.unwrap();
        let reps: Vec<u32> = runs.iter().map(RunRecord::repetition).collect();
        assert_eq!(reps, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_drain_rejects_live_runs() {
        let registry = open_registry().await;
        let p = plan(1, 0);
        registry.register(&p).await.unwrap();
        assert!(registry.drain().await.is_err());

        registry
            .transition(p.run_id(), RunTransition::Cancel { detail: "stop".into() })
            .await
            .unwrap();
        let drained = registry.drain().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());

        // lifecycle closed: a new batch can start
        registry.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_racing_transitions_single_winner() {
        let registry = Arc::new(open_registry().await);
        let p = plan(1, 0);
        registry.register(&p).await.unwrap();
        registry.record_attempt(p.run_id()).await.unwrap();

        let mut handles = vec![];
        for i in 0..32u64 {
            let registry = Arc::clone(&registry);
            let run_id = p.run_id().to_string();
            handles.push(tokio::spawn(async move {
                let transition = if i % 2 == 0 {
                    RunTransition::Succeed { sample_count: i }
                } else {
                    RunTransition::Fail {
                        kind: ErrorKind::SimulationFailure,
                        detail: format!("racer {i}"),
                    }
                };
                registry.transition(&run_id, transition).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(registry.get(p.run_id()).await.unwrap().state().is_terminal());
    }
}
