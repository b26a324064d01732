//! Virtual Data Gateway
//!
//! Resolves a logical table lookup into [`ExternalRow`]s without the caller
//! knowing where the rows live. Any backend that can answer a bounded keyed
//! range lookup implements [`DataSource`]; the gateway adds the timeout and
//! maps every timeout or outage onto `DataUnavailable`.
//!
//! A source distinguishes "no rows" (`Ok(vec![])`) from "could not answer"
//! (`Err`); only the latter is a failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use gemelo::config::GatewayConfig;
//! use gemelo::gateway::{ColumnarSource, RowQuery, VirtualDataGateway};
//!
//! # async fn example() -> gemelo::Result<()> {
//! let source = ColumnarSource::synthetic_enterprise("enterprise_context", ["c1-n0.500-l0-r0"], 10, 42)?;
//! let gateway = VirtualDataGateway::new(source, GatewayConfig::default());
//!
//! let rows = gateway
//!     .fetch_sql("SELECT * FROM enterprise_context WHERE scenario_id = 'c1-n0.500-l0-r0' AND bucket BETWEEN 0 AND 4")
//!     .await?;
//! assert_eq!(rows.len(), 5);
//! # Ok(())
//! # }
//! ```

mod columnar;
mod query;

pub use columnar::ColumnarSource;
pub use query::{RowQuery, BUCKET_COLUMN, SCENARIO_COLUMN};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::{Error, Result};

/// Key shared by samples and external rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JoinKey {
    scenario_id: String,
    bucket: u64,
}

impl JoinKey {
    /// Create a join key.
    #[must_use]
    pub fn new(scenario_id: impl Into<String>, bucket: u64) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            bucket,
        }
    }

    /// Scenario id.
    #[must_use]
    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Time bucket.
    #[must_use]
    pub const fn bucket(&self) -> u64 {
        self.bucket
    }
}

/// One row resolved by the gateway. Read-only snapshot for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRow {
    key: JoinKey,
    values: BTreeMap<String, f64>,
}

impl ExternalRow {
    /// Create a row.
    #[must_use]
    pub const fn new(key: JoinKey, values: BTreeMap<String, f64>) -> Self {
        Self { key, values }
    }

    /// Join key.
    #[must_use]
    pub const fn key(&self) -> &JoinKey {
        &self.key
    }

    /// Attribute by name.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// All attributes.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }
}

/// Backend capable of a bounded keyed range lookup.
pub trait DataSource: Send + Sync + 'static {
    /// Rows matching `query`; empty when nothing matches.
    fn lookup(&self, query: &RowQuery) -> impl Future<Output = Result<Vec<ExternalRow>>> + Send;
}

/// Wraps a source and adds a fixed network latency to every lookup.
#[derive(Debug, Clone)]
pub struct DelayedSource<S> {
    inner: S,
    delay: Duration,
}

impl<S: DataSource> DelayedSource<S> {
    /// Delay every lookup of `inner` by `delay`.
    #[must_use]
    pub const fn new(inner: S, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl<S: DataSource> DataSource for DelayedSource<S> {
    async fn lookup(&self, query: &RowQuery) -> Result<Vec<ExternalRow>> {
        tokio::time::sleep(self.delay).await;
        self.inner.lookup(query).await
    }
}

/// Timeout-enforcing front of a [`DataSource`].
pub struct VirtualDataGateway<S> {
    source: Arc<S>,
    config: GatewayConfig,
}

impl<S> Clone for VirtualDataGateway<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
        }
    }
}

impl<S: DataSource> VirtualDataGateway<S> {
    /// Create a gateway over `source`.
    #[must_use]
    pub fn new(source: S, config: GatewayConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
        }
    }

    /// Logical table this gateway joins against.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.config.table
    }

    /// Lookup timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Run `query` within the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `DataUnavailable` on timeout or source failure.
    pub async fn fetch(&self, query: &RowQuery) -> Result<Vec<ExternalRow>> {
        self.fetch_with_latency(query, Duration::ZERO).await
    }

    /// Parse and run a lookup in its SQL form.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` for unsupported SQL, otherwise as [`fetch`](Self::fetch).
    pub async fn fetch_sql(&self, sql: &str) -> Result<Vec<ExternalRow>> {
        let query = RowQuery::parse_sql(sql)?;
        self.fetch(&query).await
    }

    /// Run `query` after an injected network latency; the latency counts
    /// against the timeout.
    ///
    /// # Errors
    ///
    /// Returns `DataUnavailable` on timeout or source failure.
    pub async fn fetch_with_latency(
        &self,
        query: &RowQuery,
        latency: Duration,
    ) -> Result<Vec<ExternalRow>> {
        let timeout = self.timeout();
        let started = Instant::now();
        let lookup = async {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.source.lookup(query).await
        };

        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(rows)) => {
                debug!(
                    table = query.table(),
                    scenario_id = query.scenario_id(),
                    rows = rows.len(),
                    elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "gateway lookup"
                );
                Ok(rows)
            }
            Ok(Err(e @ Error::DataUnavailable { .. })) => Err(e),
            Ok(Err(e)) => {
                warn!(table = query.table(), error = %e, "gateway source failed");
                Err(Error::DataUnavailable {
                    table: query.table().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    table = query.table(),
                    scenario_id = query.scenario_id(),
                    timeout_ms = self.config.timeout_ms,
                    "gateway lookup timed out"
                );
                Err(Error::DataUnavailable {
                    table: query.table().to_string(),
                    reason: format!("lookup timed out after {} ms", self.config.timeout_ms),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownSource;

    impl DataSource for DownSource {
        async fn lookup(&self, _query: &RowQuery) -> Result<Vec<ExternalRow>> {
            Err(Error::StorageError("connection refused".into()))
        }
    }

    fn config(timeout_ms: u64) -> GatewayConfig {
        GatewayConfig {
            table: "enterprise_context".into(),
            timeout_ms,
        }
    }

    fn columnar() -> ColumnarSource {
        ColumnarSource::synthetic_enterprise("enterprise_context", ["s"], 10, 7).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_rows() {
        let gateway = VirtualDataGateway::new(columnar(), config(200));
        let rows = gateway
            .fetch(&RowQuery::new("enterprise_context", "s", 0..=9))
            .await
            .unwrap();
        assert_eq!(rows.len(), 10);
    }

    #[tokio::test]
    async fn test_timeout_is_data_unavailable() {
        let slow = DelayedSource::new(columnar(), Duration::from_secs(5));
        let gateway = VirtualDataGateway::new(slow, config(30));

        let started = Instant::now();
        let err = gateway
            .fetch(&RowQuery::new("enterprise_context", "s", 0..=9))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataUnavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_injected_latency_counts_against_timeout() {
        let gateway = VirtualDataGateway::new(columnar(), config(30));
        let query = RowQuery::new("enterprise_context", "s", 0..=0);
        assert!(gateway.fetch_with_latency(&query, Duration::from_millis(5)).await.is_ok());
        assert!(gateway.fetch_with_latency(&query, Duration::from_millis(200)).await.is_err());
    }

    #[tokio::test]
    async fn test_outage_is_data_unavailable() {
        let gateway = VirtualDataGateway::new(DownSource, config(100));
        let err = gateway
            .fetch(&RowQuery::new("enterprise_context", "s", 0..=1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_fetch_sql_parse_error_is_not_retryable() {
        let gateway = VirtualDataGateway::new(columnar(), config(100));
        let err = gateway.fetch_sql("SELECT * FROM t").await.unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
        assert!(!err.is_retryable());
    }
}
