//! In-memory run registry using `DashMap`.
//!
//! State lives in the process; `snapshot_to` / `restore_from` persist it as
//! JSON so a restarted process can resume a batch.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::RunRegistry;
use crate::experiment::{RunPlan, RunRecord, RunTransition};
use crate::{Error, Result};

/// In-memory run registry.
///
/// Transitions are applied while holding the entry's shard write lock, which
/// is what serializes racing transitions on the same run.
pub struct MemoryRunRegistry {
    runs: DashMap<String, RunRecord>,
    open: AtomicBool,
}

#[derive(Serialize, Deserialize)]
struct RegistrySnapshot {
    runs: Vec<RunRecord>,
}

impl MemoryRunRegistry {
    /// Create an empty, closed registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
            open: AtomicBool::new(false),
        }
    }

    /// Number of registered runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Check if no run is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Write every record to `path` as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Json` if the file cannot be written.
    pub fn snapshot_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = RegistrySnapshot {
            runs: self.sorted_records(|_| true),
        };
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &snapshot)?;
        debug!(path = %path.as_ref().display(), runs = snapshot.runs.len(), "registry snapshot written");
        Ok(())
    }

    /// Load a registry written by [`snapshot_to`](Self::snapshot_to).
    ///
    /// Runs that were still live when the snapshot was taken are parked for
    /// resumption: `Pending` if they never started, `Retrying` with their
    /// attempt history intact otherwise. Terminal runs keep their outcome. The returned registry is
    /// closed until `init` is called.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Json` if the file cannot be read or parsed.
    pub fn restore_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let snapshot: RegistrySnapshot = serde_json::from_reader(std::io::BufReader::new(file))?;

        let registry = Self::new();
        let mut resumed = 0usize;
        for mut record in snapshot.runs {
            if !record.state().is_terminal() {
                record.reset_for_resume();
                resumed += 1;
            }
            registry.runs.insert(record.run_id().to_string(), record);
        }
        info!(
            path = %path.as_ref().display(),
            runs = registry.len(),
            resumed,
            "registry restored"
        );
        Ok(registry)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::InvalidInput("run registry is not initialised".to_string()))
        }
    }

    fn sorted_records(&self, filter: impl Fn(&RunRecord) -> bool) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.run_id().cmp(b.run_id()));
        records
    }
}

impl Default for MemoryRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry for MemoryRunRegistry {
    async fn init(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidInput(
                "run registry already has an open batch".to_string(),
            ));
        }
        debug!(runs = self.runs.len(), "run registry opened");
        Ok(())
    }

    async fn register(&self, plan: &RunPlan) -> Result<RunRecord> {
        self.ensure_open()?;
        let record = self
            .runs
            .entry(plan.run_id().to_string())
            .or_insert_with(|| {
                RunRecord::new(plan.run_id(), plan.scenario().id(), plan.repetition())
            })
            .value()
            .clone();
        Ok(record)
    }

    async fn transition(&self, run_id: &str, transition: RunTransition) -> Result<RunRecord> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        let from = entry.state();
        entry.apply(transition)?;
        debug!(run_id, from = %from, to = %entry.state(), "run transition");
        Ok(entry.value().clone())
    }

    async fn get(&self, run_id: &str) -> Result<RunRecord> {
        self.runs
            .get(run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    async fn runs_for_scenario(&self, scenario_id: &str) -> Result<Vec<RunRecord>> {
        let mut records = self.sorted_records(|r| r.scenario_id() == scenario_id);
        records.sort_by_key(RunRecord::repetition);
        Ok(records)
    }

    async fn all(&self) -> Result<Vec<RunRecord>> {
        Ok(self.sorted_records(|_| true))
    }

    async fn drain(&self) -> Result<Vec<RunRecord>> {
        let live: Vec<String> = self
            .runs
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        if !live.is_empty() {
            return Err(Error::InvalidInput(format!(
                "cannot drain registry with {} live run(s), first: {}",
                live.len(),
                live[0]
            )));
        }

        let records = self.sorted_records(|_| true);
        self.runs.clear();
        self.open.store(false, Ordering::Release);
        info!(runs = records.len(), "run registry drained");
        Ok(records)
    }
}
