//! Local columnar backend (Arrow/Parquet)
//!
//! Append-only set of Arrow record batches for one logical table. Every
//! batch carries the join columns (`scenario_id: Utf8`, `bucket: UInt64`);
//! all other `Float64` columns become the row's attributes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, StringArray, UInt64Array};
use arrow::compute::kernels::cmp::{eq, gt_eq, lt_eq};
use arrow::compute::{and, filter_record_batch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::query::{BUCKET_COLUMN, SCENARIO_COLUMN};
use super::{DataSource, ExternalRow, JoinKey, RowQuery};
use crate::telemetry::derive_seed;
use crate::{Error, Result};

/// In-process Arrow table answering keyed range lookups.
#[derive(Debug, Clone)]
pub struct ColumnarSource {
    table: String,
    batches: Vec<RecordBatch>,
}

impl ColumnarSource {
    /// Create a source from existing batches.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if a batch lacks the join columns or the
    /// batches disagree on their schema.
    pub fn new(table: impl Into<String>, batches: Vec<RecordBatch>) -> Result<Self> {
        let mut source = Self {
            table: table.into(),
            batches: Vec::with_capacity(batches.len()),
        };
        for batch in batches {
            source.append_batch(batch)?;
        }
        Ok(source)
    }

    /// Load a table from a Parquet file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed, or lacks the join
    /// columns.
    pub fn load_parquet<P: AsRef<Path>>(table: impl Into<String>, path: P) -> Result<Self> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
        use std::fs::File;

        let file = File::open(path.as_ref())
            .map_err(|e| Error::StorageError(format!("Failed to open Parquet file: {e}")))?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?
            .build()
            .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(
                batch.map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))?,
            );
        }

        Self::new(table, batches)
    }

    /// Synthetic enterprise context for a set of scenarios: one row per
    /// `(scenario, bucket)` with `demand`, `inventory` and `energy_price`.
    ///
    /// # Errors
    ///
    /// Returns `Arrow` if the batch cannot be assembled.
    pub fn synthetic_enterprise<'a>(
        table: impl Into<String>,
        scenario_ids: impl IntoIterator<Item = &'a str>,
        buckets: u64,
        seed: u64,
    ) -> Result<Self> {
        let mut ids = Vec::new();
        let mut bucket_col = Vec::new();
        let mut demand = Vec::new();
        let mut inventory = Vec::new();
        let mut energy_price = Vec::new();

        for scenario_id in scenario_ids {
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, scenario_id));
            for bucket in 0..buckets {
                ids.push(scenario_id.to_string());
                bucket_col.push(bucket);
                demand.push(rng.gen_range(50.0..150.0));
                inventory.push(rng.gen_range(0.0..1_000.0));
                energy_price.push(rng.gen_range(0.08..0.35));
            }
        }

        let schema = Arc::new(Schema::new(vec![
            Field::new(SCENARIO_COLUMN, DataType::Utf8, false),
            Field::new(BUCKET_COLUMN, DataType::UInt64, false),
            Field::new("demand", DataType::Float64, false),
            Field::new("inventory", DataType::Float64, false),
            Field::new("energy_price", DataType::Float64, false),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(UInt64Array::from(bucket_col)),
            Arc::new(Float64Array::from(demand)),
            Arc::new(Float64Array::from(inventory)),
            Arc::new(Float64Array::from(energy_price)),
        ];
        let batch = RecordBatch::try_new(schema, columns)?;
        Self::new(table, vec![batch])
    }

    /// Logical table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// All record batches.
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total row count.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Append a batch (the only write operation).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the batch lacks the join columns or its
    /// schema differs from the existing batches.
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<()> {
        check_join_columns(&batch.schema())?;
        if let Some(first) = self.batches.first() {
            let existing_schema = first.schema();
            if batch.schema() != existing_schema {
                return Err(Error::StorageError(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    existing_schema,
                    batch.schema()
                )));
            }
        }
        self.batches.push(batch);
        Ok(())
    }

    /// Synchronous lookup; [`DataSource::lookup`] wraps this.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` for a foreign table and `Arrow` if a compute
    /// kernel fails.
    pub fn scan(&self, query: &RowQuery) -> Result<Vec<ExternalRow>> {
        if query.table() != self.table {
            return Err(Error::StorageError(format!(
                "table '{}' is not served by this source ('{}')",
                query.table(),
                self.table
            )));
        }

        let mut rows = Vec::new();
        for batch in &self.batches {
            let filtered = filter_record_batch(batch, &key_mask(batch, query)?)?;
            rows.extend(batch_to_rows(&filtered)?);
        }
        rows.sort_by_key(|row| row.key().bucket());
        if let Some(limit) = query.limit() {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

impl DataSource for ColumnarSource {
    async fn lookup(&self, query: &RowQuery) -> Result<Vec<ExternalRow>> {
        self.scan(query)
    }
}

fn check_join_columns(schema: &SchemaRef) -> Result<()> {
    for (name, data_type) in [
        (SCENARIO_COLUMN, DataType::Utf8),
        (BUCKET_COLUMN, DataType::UInt64),
    ] {
        match schema.field_with_name(name) {
            Ok(field) if field.data_type() == &data_type => {}
            Ok(field) => {
                return Err(Error::StorageError(format!(
                    "column '{name}' must be {data_type:?}, found {:?}",
                    field.data_type()
                )))
            }
            Err(_) => {
                return Err(Error::StorageError(format!("missing join column '{name}'")));
            }
        }
    }
    Ok(())
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::StorageError(format!("missing join column '{name}'")))
}

fn key_mask(batch: &RecordBatch, query: &RowQuery) -> Result<BooleanArray> {
    let scenario = column(batch, SCENARIO_COLUMN)?;
    let bucket = column(batch, BUCKET_COLUMN)?;

    let same_scenario = eq(scenario, &StringArray::new_scalar(query.scenario_id()))?;
    let from = gt_eq(bucket, &UInt64Array::new_scalar(*query.buckets().start()))?;
    let to = lt_eq(bucket, &UInt64Array::new_scalar(*query.buckets().end()))?;
    Ok(and(&same_scenario, &and(&from, &to)?)?)
}

fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<ExternalRow>> {
    let scenario = column(batch, SCENARIO_COLUMN)?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::StorageError(format!("'{SCENARIO_COLUMN}' is not Utf8")))?;
    let bucket = column(batch, BUCKET_COLUMN)?
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| Error::StorageError(format!("'{BUCKET_COLUMN}' is not UInt64")))?;

    let schema = batch.schema();
    let attributes: Vec<(&str, &Float64Array)> = schema
        .fields()
        .iter()
        .zip(batch.columns())
        .filter_map(|(field, array)| {
            array
                .as_any()
                .downcast_ref::<Float64Array>()
                .map(|values| (field.name().as_str(), values))
        })
        .collect();

    let rows = (0..batch.num_rows())
        .map(|i| {
            let values: BTreeMap<String, f64> = attributes
                .iter()
                .filter(|(_, array)| array.is_valid(i))
                .map(|(name, array)| ((*name).to_string(), array.value(i)))
                .collect();
            ExternalRow::new(JoinKey::new(scenario.value(i), bucket.value(i)), values)
        })
        .collect();
    Ok(rows)
}
