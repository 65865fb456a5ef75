use linfa::Dataset;
use linfa::traits::Fit;
use linfa_linear::LinearRegression as LeastSquares;
use mlreg_core::{RegistryError, Result};
use ndarray::{Array1, Array2, Axis, concatenate};
use serde::{Deserialize, Serialize};

use super::params::ParamReader;
use crate::types::Parameters;

#[derive(Debug, Clone, PartialEq)]
pub struct LinearParams {
    /// Ridge penalty; zero gives ordinary least squares.
    pub alpha: f64,
    pub fit_intercept: bool,
}

impl LinearParams {
    pub const ACCEPTED: &'static [&'static str] = &["alpha", "fit_intercept"];

    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let reader = ParamReader::new(params, Self::ACCEPTED)?;
        Ok(Self {
            alpha: reader.f64_or("alpha", 0.0, |v| v >= 0.0, "a number >= 0")?,
            fit_intercept: reader.bool_or("fit_intercept", true)?,
        })
    }
}

/// Fitted hyperplane in original feature units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegression {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

fn fit_error(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::training(format!("linear regression: {e}"))
}

impl LinearRegression {
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>, params: &LinearParams) -> Result<Self> {
        if params.alpha == 0.0 {
            let fitted = LeastSquares::new()
                .with_intercept(params.fit_intercept)
                .fit(&Dataset::new(x.clone(), y.clone()))
                .map_err(fit_error)?;
            return Ok(Self {
                coefficients: fitted.params().to_vec(),
                intercept: fitted.intercept(),
            });
        }

        // Ridge: least squares on centered data stacked over sqrt(alpha)·I
        // with zero targets.
        let d = x.ncols();
        let (x_mean, y_mean) = if params.fit_intercept {
            (
                x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d)),
                y.mean().unwrap_or(0.0),
            )
        } else {
            (Array1::zeros(d), 0.0)
        };
        let penalty = Array2::<f64>::eye(d) * params.alpha.sqrt();
        let centered = x - &x_mean;
        let records = concatenate(Axis(0), &[centered.view(), penalty.view()]).map_err(fit_error)?;
        let shifted = y - y_mean;
        let zeros = Array1::<f64>::zeros(d);
        let targets = concatenate(Axis(0), &[shifted.view(), zeros.view()]).map_err(fit_error)?;

        let fitted = LeastSquares::new()
            .with_intercept(false)
            .fit(&Dataset::new(records, targets))
            .map_err(fit_error)?;
        let weights = fitted.params();
        Ok(Self {
            coefficients: weights.to_vec(),
            intercept: y_mean - x_mean.dot(weights),
        })
    }

    pub fn predict_row(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(w, v)| w * v)
                .sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(slope: f64, intercept: f64) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((5, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| slope * v + intercept);
        (x, y)
    }

    fn ols() -> LinearParams {
        LinearParams {
            alpha: 0.0,
            fit_intercept: true,
        }
    }

    #[test]
    fn test_fits_exact_line() {
        let (x, y) = line(3.0, 1.0);
        let model = LinearRegression::fit(&x, &y, &ols()).unwrap();
        assert!((model.coefficients[0] - 3.0).abs() < 1e-9);
        assert!((model.intercept - 1.0).abs() < 1e-9);
        assert!((model.predict_row(&[10.0]) - 31.0).abs() < 1e-9);
    }

    #[test]
    fn test_ridge_shrinks_coefficients() {
        let (x, y) = line(3.0, 0.0);
        let ridge = LinearRegression::fit(
            &x,
            &y,
            &LinearParams {
                alpha: 10.0,
                fit_intercept: true,
            },
        )
        .unwrap();
        // Closed form for one centered feature: Sxy / (Sxx + alpha) = 30 / 20
        assert!((ridge.coefficients[0] - 1.5).abs() < 1e-9);
        assert!((ridge.intercept - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_params_reject_negative_alpha() {
        let params: Parameters = serde_json::from_str(r#"{"alpha": -1.0}"#).unwrap();
        let err = LinearParams::from_parameters(&params).unwrap_err();
        assert_eq!(err.field(), Some("parameters.alpha"));
    }
}
