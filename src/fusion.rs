//! Fused windows: time-aligned merge of telemetry and external rows
//!
//! Samples are bucketed by `seq / window_size`; each bucket is joined with
//! the external rows carrying the same [`JoinKey`]. Every window upholds:
//!
//! - all samples and rows share one scenario id
//! - samples are contiguous and strictly timestamp-ordered
//! - all rows carry the window's bucket

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gateway::{ExternalRow, JoinKey};
use crate::telemetry::Sample;
use crate::{Error, Result};

/// Bounded, time-aligned model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedWindow {
    key: JoinKey,
    samples: Vec<Sample>,
    rows: Vec<ExternalRow>,
}

impl FusedWindow {
    /// Build one window, checking its invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWindow` if the window is empty, mixes scenarios,
    /// has a gap or is out of order, or carries rows for another key.
    pub fn new(bucket: u64, samples: Vec<Sample>, rows: Vec<ExternalRow>) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(Error::InvalidWindow(format!("bucket {bucket} has no samples")));
        };
        let key = JoinKey::new(first.scenario_id(), bucket);

        for pair in samples.windows(2) {
            if pair[1].scenario_id() != key.scenario_id() {
                return Err(Error::InvalidWindow(format!(
                    "bucket {bucket} mixes scenarios '{}' and '{}'",
                    key.scenario_id(),
                    pair[1].scenario_id()
                )));
            }
            if pair[1].seq() != pair[0].seq() + 1 || pair[1].timestamp_us() <= pair[0].timestamp_us() {
                return Err(Error::InvalidWindow(format!(
                    "bucket {bucket} is not contiguous at sample {}",
                    pair[1].seq()
                )));
            }
        }

        if let Some(row) = rows.iter().find(|row| row.key() != &key) {
            return Err(Error::InvalidWindow(format!(
                "row {:?} does not belong to window {key:?}",
                row.key()
            )));
        }

        Ok(Self { key, samples, rows })
    }

    /// Split a run's samples into windows of `window_size` and join each
    /// with the rows of its bucket. Buckets without rows get none.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWindow` for a zero window size, rows of a foreign
    /// scenario, or samples that break a window invariant.
    pub fn assemble(
        samples: Vec<Sample>,
        rows: Vec<ExternalRow>,
        window_size: usize,
    ) -> Result<Vec<Self>> {
        if window_size == 0 {
            return Err(Error::InvalidWindow("window size must be >= 1".to_string()));
        }

        let mut rows_by_bucket: BTreeMap<u64, Vec<ExternalRow>> = BTreeMap::new();
        for row in rows {
            rows_by_bucket.entry(row.key().bucket()).or_default().push(row);
        }

        let size = window_size as u64;
        let mut windows = Vec::with_capacity(samples.len().div_ceil(window_size));
        let mut current: Vec<Sample> = Vec::with_capacity(window_size);
        let mut current_bucket = None;

        for sample in samples {
            let bucket = sample.seq() / size;
            if current_bucket.is_some_and(|b| b != bucket) {
                let b = current_bucket.unwrap_or(bucket);
                let rows = rows_by_bucket.remove(&b).unwrap_or_default();
                windows.push(Self::new(b, std::mem::take(&mut current), rows)?);
            }
            current_bucket = Some(bucket);
            current.push(sample);
        }
        if let Some(b) = current_bucket {
            let rows = rows_by_bucket.remove(&b).unwrap_or_default();
            windows.push(Self::new(b, current, rows)?);
        }

        Ok(windows)
    }

    /// Join key of the window.
    #[must_use]
    pub const fn key(&self) -> &JoinKey {
        &self.key
    }

    /// Scenario id shared by every row.
    #[must_use]
    pub fn scenario_id(&self) -> &str {
        self.key.scenario_id()
    }

    /// Time bucket.
    #[must_use]
    pub const fn bucket(&self) -> u64 {
        self.key.bucket()
    }

    /// Telemetry samples, timestamp-ordered.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// External rows joined to this window.
    #[must_use]
    pub fn rows(&self) -> &[ExternalRow] {
        &self.rows
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false for a constructed window.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// First and last sample timestamp (microseconds).
    #[must_use]
    pub fn span_us(&self) -> (u64, u64) {
        let first = self.samples.first().map_or(0, Sample::timestamp_us);
        let last = self.samples.last().map_or(first, Sample::timestamp_us);
        (first, last)
    }

    /// Observed positions, the ground truth for this window.
    #[must_use]
    pub fn positions(&self) -> Vec<f64> {
        self.samples.iter().map(Sample::position).collect()
    }
}
