//! Parquet export of the result set.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array, UInt8Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use tracing::info;

use crate::experiment::RunMetrics;
use crate::Result;

/// Writes accumulated [`RunMetrics`] as one Parquet file, one row per run.
#[derive(Debug, Clone)]
pub struct ParquetResultSink {
    path: PathBuf,
}

impl ParquetResultSink {
    /// Sink writing to `path` (overwritten on every write).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arrow schema of the exported table.
    #[must_use]
    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("run_id", DataType::Utf8, false),
            Field::new("scenario_id", DataType::Utf8, false),
            Field::new("complexity", DataType::UInt8, false),
            Field::new("noise", DataType::Float64, false),
            Field::new("coefficient", DataType::Float64, false),
            Field::new("intercept", DataType::Float64, false),
            Field::new("rmse", DataType::Float64, false),
            Field::new("mae", DataType::Float64, false),
            Field::new("fit_ms", DataType::Float64, false),
            Field::new("predict_ms", DataType::Float64, false),
            Field::new("join_ms", DataType::Float64, false),
            Field::new("sla_violated", DataType::Boolean, false),
            Field::new("partial_data", DataType::Boolean, false),
            Field::new("attempts", DataType::UInt32, false),
        ]))
    }

    /// Convert records into a single record batch.
    ///
    /// # Errors
    ///
    /// Returns `Arrow` if the batch cannot be assembled.
    pub fn to_record_batch(metrics: &[RunMetrics]) -> Result<RecordBatch> {
        fn floats(metrics: &[RunMetrics], f: impl Fn(&RunMetrics) -> f64) -> ArrayRef {
            Arc::new(Float64Array::from_iter_values(metrics.iter().map(f)))
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(metrics.iter().map(RunMetrics::run_id))),
            Arc::new(StringArray::from_iter_values(metrics.iter().map(RunMetrics::scenario_id))),
            Arc::new(UInt8Array::from_iter_values(metrics.iter().map(RunMetrics::complexity))),
            floats(metrics, RunMetrics::noise_level),
            floats(metrics, RunMetrics::coefficient),
            floats(metrics, RunMetrics::intercept),
            floats(metrics, RunMetrics::rmse),
            floats(metrics, RunMetrics::mae),
            floats(metrics, RunMetrics::fit_ms),
            floats(metrics, RunMetrics::predict_ms),
            floats(metrics, RunMetrics::join_ms),
            Arc::new(BooleanArray::from(
                metrics.iter().map(RunMetrics::sla_violated).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                metrics.iter().map(RunMetrics::partial_data).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from_iter_values(metrics.iter().map(RunMetrics::attempts))),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    /// Write `metrics` to the sink's file, returning the row count.
    ///
    /// # Errors
    ///
    /// Returns `Io`, `Arrow` or `Parquet` if the file cannot be written.
    pub fn write(&self, metrics: &[RunMetrics]) -> Result<usize> {
        let batch = Self::to_record_batch(metrics)?;
        let file = File::create(&self.path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        info!(path = %self.path.display(), rows = metrics.len(), "result set written");
        Ok(metrics.len())
    }
}
