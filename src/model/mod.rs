//! World Model Service
//!
//! Wraps any [`WorldModel`] with the pipeline's latency contract:
//!
//! - `fit` and `predict` each run under an explicit deadline; missing it is
//!   `DeadlineExceeded`, never a stale or partial result.
//! - A zero deadline fails immediately without touching the model.
//! - Fitted handles are immutable and `Arc`-shared, so concurrent `predict`
//!   calls read them freely; `fit` calls are serialized.
//!
//! The reference predictor is [`LinearWorldModel`] (ordinary least squares).
//! A learned sequence model satisfies the same trait and the same deadlines.

mod linear;

pub use linear::{LinearFit, LinearWorldModel};

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fusion::FusedWindow;
use crate::gateway::{ExternalRow, JoinKey};
use crate::{Error, Result};

/// Diagnostics every fitted model exposes.
pub trait Diagnostics {
    /// Slope of the response on the control input.
    fn coefficient(&self) -> f64;
    /// Offset of the response.
    fn intercept(&self) -> f64;
    /// Residual standard deviation, reported as prediction uncertainty.
    fn residual_std(&self) -> Option<f64>;
}

/// A predictor of future robot state from fused windows.
pub trait WorldModel: Send + Sync + 'static {
    /// Fitted, immutable model state.
    type Fitted: Diagnostics + Send + Sync + 'static;

    /// Train on `windows`. Must be deterministic for a fixed seed.
    fn fit(
        &self,
        windows: &[FusedWindow],
        seed: u64,
    ) -> impl Future<Output = Result<Self::Fitted>> + Send;

    /// Forecast one position per sample of `window`.
    fn predict(
        &self,
        fitted: &Self::Fitted,
        window: &FusedWindow,
    ) -> impl Future<Output = Result<Vec<f64>>> + Send;
}

/// Shared, read-only handle to a fitted model.
#[derive(Debug)]
pub struct ModelHandle<F> {
    fitted: Arc<F>,
    seed: u64,
    fit_time: Duration,
}

impl<F> Clone for ModelHandle<F> {
    fn clone(&self) -> Self {
        Self {
            fitted: Arc::clone(&self.fitted),
            seed: self.seed,
            fit_time: self.fit_time,
        }
    }
}

impl<F> ModelHandle<F> {
    /// Seed the model was fitted with.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Wall time of the `fit` call.
    #[must_use]
    pub const fn fit_time(&self) -> Duration {
        self.fit_time
    }
}

impl<F> Deref for ModelHandle<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.fitted
    }
}

/// Model output for one fused window, joined with the window's external rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    key: JoinKey,
    forecast: Vec<f64>,
    uncertainty: Option<f64>,
    latency: Duration,
    context: Vec<ExternalRow>,
}

impl Prediction {
    /// Window the prediction belongs to.
    #[must_use]
    pub const fn key(&self) -> &JoinKey {
        &self.key
    }

    /// Forecast vector, one entry per sample of the window.
    #[must_use]
    pub fn forecast(&self) -> &[f64] {
        &self.forecast
    }

    /// Residual standard deviation of the fitted model, if it reports one.
    #[must_use]
    pub const fn uncertainty(&self) -> Option<f64> {
        self.uncertainty
    }

    /// Measured wall time of the `predict` call.
    #[must_use]
    pub const fn latency(&self) -> Duration {
        self.latency
    }

    /// External rows served alongside the forecast.
    #[must_use]
    pub fn context(&self) -> &[ExternalRow] {
        &self.context
    }
}

/// Deadline-enforcing front of a [`WorldModel`].
pub struct WorldModelService<M> {
    model: Arc<M>,
    seed: u64,
    fit_lock: Mutex<()>,
}

impl<M: WorldModel> WorldModelService<M> {
    /// Create a service; `seed` is handed to every `fit`.
    #[must_use]
    pub fn new(model: M, seed: u64) -> Self {
        Self {
            model: Arc::new(model),
            seed,
            fit_lock: Mutex::new(()),
        }
    }

    /// Underlying model.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Fit on `windows` within `deadline`.
    ///
    /// Time spent waiting for another fit counts against the deadline.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if the deadline is zero or missed, and
    /// whatever the model returns otherwise (`ModelFitFailure` for
    /// degenerate data).
    pub async fn fit(
        &self,
        windows: &[FusedWindow],
        deadline: Duration,
    ) -> Result<ModelHandle<M::Fitted>> {
        if deadline.is_zero() {
            return Err(Error::deadline("fit", deadline));
        }
        let started = Instant::now();
        let work = async {
            let _guard = self.fit_lock.lock().await;
            self.model.fit(windows, self.seed).await
        };

        let fitted = tokio::time::timeout(deadline, work)
            .await
            .map_err(|_| self.missed("fit", deadline))??;

        let fit_time = started.elapsed();
        if fit_time > deadline {
            return Err(self.missed("fit", deadline));
        }
        debug!(
            windows = windows.len(),
            fit_ms = fit_time.as_secs_f64() * 1000.0,
            coefficient = fitted.coefficient(),
            intercept = fitted.intercept(),
            "model fitted"
        );
        Ok(ModelHandle {
            fitted: Arc::new(fitted),
            seed: self.seed,
            fit_time,
        })
    }

    /// Predict `window` within `deadline`.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if the deadline is zero or missed.
    pub async fn predict(
        &self,
        handle: &ModelHandle<M::Fitted>,
        window: &FusedWindow,
        deadline: Duration,
    ) -> Result<Prediction> {
        if deadline.is_zero() {
            return Err(Error::deadline("predict", deadline));
        }
        let started = Instant::now();
        let forecast = tokio::time::timeout(deadline, self.model.predict(&handle.fitted, window))
            .await
            .map_err(|_| self.missed("predict", deadline))??;

        let latency = started.elapsed();
        if latency > deadline {
            return Err(self.missed("predict", deadline));
        }
        if forecast.len() != window.len() {
            return Err(Error::Other(format!(
                "model returned {} forecasts for a window of {} samples",
                forecast.len(),
                window.len()
            )));
        }

        Ok(Prediction {
            key: window.key().clone(),
            forecast,
            uncertainty: handle.residual_std(),
            latency,
            context: window.rows().to_vec(),
        })
    }

    #[allow(clippy::unused_self)]
    fn missed(&self, operation: &str, deadline: Duration) -> Error {
        warn!(
            operation,
            budget_ms = deadline.as_secs_f64() * 1000.0,
            "model deadline exceeded"
        );
        Error::deadline(operation, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Sample;

    fn windows(f: impl Fn(f64) -> f64) -> Vec<FusedWindow> {
        let samples: Vec<Sample> = (0..40u32)
            .map(|i| {
                let x = f64::from(i % 10) + 0.25 * f64::from(i / 10);
                Sample::new("s", u64::from(i), u64::from(i) * 1000, x, f(x))
            })
            .collect();
        FusedWindow::assemble(samples, vec![], 10).unwrap()
    }

    struct SlowModel(Duration);

    impl WorldModel for SlowModel {
        type Fitted = LinearFit;

        async fn fit(&self, windows: &[FusedWindow], seed: u64) -> Result<LinearFit> {
            tokio::time::sleep(self.0).await;
            LinearWorldModel.fit(windows, seed).await
        }

        async fn predict(&self, fitted: &LinearFit, window: &FusedWindow) -> Result<Vec<f64>> {
            tokio::time::sleep(self.0).await;
            LinearWorldModel.predict(fitted, window).await
        }
    }

    #[tokio::test]
    async fn test_fit_recovers_true_line() {
        let service = WorldModelService::new(LinearWorldModel::new(), 42);
        let handle = service
            .fit(&windows(|x| 2.0 * x + 5.0), Duration::from_secs(1))
            .await
            .unwrap();
        assert!((handle.coefficient() - 2.0).abs() < 1e-9);
        assert!((handle.intercept() - 5.0).abs() < 1e-9);
        assert_eq!(handle.seed(), 42);
    }

    #[tokio::test]
    async fn test_fit_is_idempotent() {
        let service = WorldModelService::new(LinearWorldModel::new(), 7);
        let data = windows(|x| 0.3 * x * x + 2.0 * x + 5.0);
        let a = service.fit(&data, Duration::from_secs(1)).await.unwrap();
        let b = service.fit(&data, Duration::from_secs(1)).await.unwrap();
        assert_eq!(*a, *b);
    }

    #[tokio::test]
    async fn test_predict_returns_forecast_per_sample() {
        let service = WorldModelService::new(LinearWorldModel::new(), 42);
        let data = windows(|x| 2.0 * x + 5.0);
        let handle = service.fit(&data, Duration::from_secs(1)).await.unwrap();

        let prediction = service
            .predict(&handle, &data[1], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(prediction.forecast().len(), data[1].len());
        assert_eq!(prediction.key().bucket(), 1);
        for (forecast, truth) in prediction.forecast().iter().zip(data[1].positions()) {
            assert!((forecast - truth).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_zero_deadline_always_fails() {
        let service = WorldModelService::new(LinearWorldModel::new(), 42);
        let data = windows(|x| 2.0 * x + 5.0);
        let handle = service.fit(&data, Duration::from_secs(1)).await.unwrap();

        for window in &data {
            let err = service.predict(&handle, window, Duration::ZERO).await.unwrap_err();
            assert!(matches!(err, Error::DeadlineExceeded { .. }));
        }
        let err = service.fit(&data, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn test_slow_predict_misses_deadline() {
        let service = WorldModelService::new(SlowModel(Duration::from_millis(200)), 42);
        let data = windows(|x| 2.0 * x + 5.0);
        let handle = service.fit(&data, Duration::from_secs(2)).await.unwrap();

        let started = Instant::now();
        let err = service
            .predict(&handle, &data[0], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, Error::DeadlineExceeded { ref operation, .. } if operation == "predict"));
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_degenerate_fit() {
        let service = WorldModelService::new(LinearWorldModel::new(), 42);
        let err = service.fit(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::ModelFitFailure(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_concurrent_predicts_share_handle() {
        let service = Arc::new(WorldModelService::new(LinearWorldModel::new(), 42));
        let data = Arc::new(windows(|x| 2.0 * x + 5.0));
        let handle = service.fit(&data, Duration::from_secs(1)).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..data.len() {
            let service = Arc::clone(&service);
            let data = Arc::clone(&data);
            let handle = handle.clone();
            tasks.spawn(async move {
                service
                    .predict(&handle, &data[i], Duration::from_millis(500))
                    .await
                    .map(|p| p.forecast().len())
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap(), 10);
        }
    }
}
