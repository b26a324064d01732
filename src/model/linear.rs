//! Ordinary least squares reference predictor.

use super::{Diagnostics, WorldModel};
use crate::fusion::FusedWindow;
use crate::telemetry::Sample;
use crate::{Error, Result};

/// Fitted OLS parameters of `position = coefficient·control + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    coefficient: f64,
    intercept: f64,
    residual_std: f64,
    samples: usize,
}

impl LinearFit {
    /// Number of training samples.
    #[must_use]
    pub const fn samples(&self) -> usize {
        self.samples
    }

    /// Point forecast for one control input.
    #[must_use]
    pub fn forecast(&self, control: f64) -> f64 {
        self.coefficient.mul_add(control, self.intercept)
    }
}

impl Diagnostics for LinearFit {
    fn coefficient(&self) -> f64 {
        self.coefficient
    }

    fn intercept(&self) -> f64 {
        self.intercept
    }

    fn residual_std(&self) -> Option<f64> {
        Some(self.residual_std)
    }
}

/// OLS world model. Deterministic, so the seed does not affect the fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearWorldModel;

impl LinearWorldModel {
    /// Create the model.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Fit directly on `(control, position)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `ModelFitFailure` for fewer than two points, non-finite values
    /// or zero variance in the control input.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit_points(points: &[(f64, f64)]) -> Result<LinearFit> {
        let n = points.len();
        if n < 2 {
            return Err(Error::ModelFitFailure(format!(
                "need at least 2 samples, got {n}"
            )));
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(Error::ModelFitFailure("training data contains non-finite values".to_string()));
        }

        let nf = n as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / nf;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / nf;

        let (sxx, sxy) = points.iter().fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
            let dx = x - mean_x;
            (dx.mul_add(dx, sxx), dx.mul_add(y - mean_y, sxy))
        });

        if sxx <= f64::EPSILON * nf * mean_x.abs().max(1.0) {
            return Err(Error::ModelFitFailure(
                "control input has zero variance".to_string(),
            ));
        }

        let coefficient = sxy / sxx;
        let intercept = coefficient.mul_add(-mean_x, mean_y);

        let sse: f64 = points
            .iter()
            .map(|(x, y)| {
                let r = y - coefficient.mul_add(*x, intercept);
                r * r
            })
            .sum();
        let residual_std = if n > 2 { (sse / (nf - 2.0)).sqrt() } else { 0.0 };

        Ok(LinearFit {
            coefficient,
            intercept,
            residual_std,
            samples: n,
        })
    }
}

impl WorldModel for LinearWorldModel {
    type Fitted = LinearFit;

    async fn fit(&self, windows: &[FusedWindow], _seed: u64) -> Result<LinearFit> {
        let points: Vec<(f64, f64)> = windows
            .iter()
            .flat_map(FusedWindow::samples)
            .map(|s: &Sample| (s.control(), s.position()))
            .collect();
        Self::fit_points(&points)
    }

    async fn predict(&self, fitted: &LinearFit, window: &FusedWindow) -> Result<Vec<f64>> {
        Ok(window
            .samples()
            .iter()
            .map(|s| fitted.forecast(s.control()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_exact_line() {
        let points: Vec<(f64, f64)> = (0..20).map(|i| (f64::from(i) * 0.5, f64::from(i) + 5.0)).collect();
        let fit = LinearWorldModel::fit_points(&points).unwrap();
        assert!((fit.coefficient() - 2.0).abs() < 1e-10);
        assert!((fit.intercept() - 5.0).abs() < 1e-10);
        assert!(fit.residual_std().unwrap() < 1e-9);
        assert!((fit.forecast(3.0) - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(matches!(
            LinearWorldModel::fit_points(&[(1.0, 2.0)]),
            Err(Error::ModelFitFailure(_))
        ));
        assert!(matches!(
            LinearWorldModel::fit_points(&[(3.0, 1.0), (3.0, 2.0), (3.0, 4.0)]),
            Err(Error::ModelFitFailure(_))
        ));
        assert!(matches!(
            LinearWorldModel::fit_points(&[(1.0, f64::NAN), (2.0, 3.0)]),
            Err(Error::ModelFitFailure(_))
        ));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: noise-free lines are recovered for any slope and offset
            #[test]
            fn prop_recovers_any_line(
                slope in -50.0f64..50.0,
                offset in -100.0f64..100.0,
                xs in prop::collection::vec(0.0f64..10.0, 3..50),
            ) {
                let mut xs = xs;
                xs.push(0.0);
                xs.push(10.0);
                let points: Vec<(f64, f64)> = xs.iter().map(|&x| (x, slope.mul_add(x, offset))).collect();
                let fit = LinearWorldModel::fit_points(&points).unwrap();
                prop_assert!((fit.coefficient() - slope).abs() < 1e-6);
                prop_assert!((fit.intercept() - offset).abs() < 1e-6);
            }
        }
    }
}
