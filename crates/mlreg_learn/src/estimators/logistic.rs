use linfa::Dataset;
use linfa::traits::Fit;
use linfa_logistic::MultiLogisticRegression;
use mlreg_core::{RegistryError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::params::ParamReader;
use super::scaler::Scaler;
use crate::types::Parameters;

#[derive(Debug, Clone, PartialEq)]
pub struct LogisticParams {
    /// Inverse regularization strength.
    pub c: f64,
    pub max_iter: u64,
    pub tol: f64,
}

impl LogisticParams {
    pub const ACCEPTED: &'static [&'static str] = &["C", "max_iter", "tol"];

    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let reader = ParamReader::new(params, Self::ACCEPTED)?;
        Ok(Self {
            c: reader.f64_or("C", 1.0, |v| v > 0.0, "a number > 0")?,
            max_iter: reader.usize_or("max_iter", 1000, 1..=100_000)? as u64,
            tol: reader.f64_or("tol", 1e-6, |v| v > 0.0, "a number > 0")?,
        })
    }
}

/// Multinomial logistic regression over standardized features.
///
/// Rows of `weights` line up with `class_index`, which maps them back to
/// the dataset's class list; classes absent from the training split get
/// probability zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub scaler: Scaler,
    pub class_index: Vec<usize>,
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub n_classes: usize,
}

impl LogisticRegression {
    pub fn fit(x: &Array2<f64>, y: &Array1<usize>, n_classes: usize, params: &LogisticParams) -> Result<Self> {
        let mut present: Vec<usize> = y.to_vec();
        present.sort_unstable();
        present.dedup();
        if present.len() < 2 {
            return Err(RegistryError::training(
                "logistic regression needs at least two distinct classes",
            ));
        }

        let scaler = Scaler::fit(x);
        let fitted = MultiLogisticRegression::default()
            .alpha(1.0 / params.c)
            .max_iterations(params.max_iter)
            .gradient_tolerance(params.tol)
            .fit(&Dataset::new(scaler.transform(x), y.clone()))
            .map_err(|e| RegistryError::training(format!("logistic regression: {e}")))?;

        let weights = fitted.params();
        Ok(Self {
            scaler,
            class_index: fitted.classes().to_vec(),
            weights: weights.columns().into_iter().map(|w| w.to_vec()).collect(),
            bias: fitted.intercept().to_vec(),
            n_classes,
        })
    }

    /// Probability per dataset class for one unscaled row.
    pub fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let row = self.scaler.transform_row(row);
        let logits: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| b + w.iter().zip(&row).map(|(w, v)| w * v).sum::<f64>())
            .collect();
        let mut probabilities = vec![0.0; self.n_classes];
        for (&class, p) in self.class_index.iter().zip(softmax(&logits)) {
            probabilities[class] = p;
        }
        probabilities
    }

    /// Log-odds slope per original feature unit for a two-class model.
    pub fn binary_coefficients(&self) -> Option<Vec<f64>> {
        let [negative, positive] = self.weights.as_slice() else {
            return None;
        };
        Some(
            positive
                .iter()
                .zip(negative)
                .zip(&self.scaler.scale)
                .map(|((a, b), s)| (a - b) / s)
                .collect(),
        )
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|z| (z - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> LogisticParams {
        LogisticParams::from_parameters(&Parameters::new()).unwrap()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_separates_two_clusters() {
        let x = Array2::from_shape_fn((20, 1), |(i, _)| {
            if i < 10 { -1.0 - i as f64 * 0.1 } else { 1.0 + i as f64 * 0.1 }
        });
        let y = Array1::from_shape_fn(20, |i| usize::from(i >= 10));
        let model = LogisticRegression::fit(&x, &y, 2, &defaults()).unwrap();
        assert!(model.predict_proba(&[-2.0])[0] > 0.5);
        assert!(model.predict_proba(&[2.0])[1] > 0.5);
        assert!(model.binary_coefficients().unwrap()[0] > 0.0);
    }

    #[test]
    fn test_three_classes() {
        let x = ndarray::array![
            [-2.0, 0.0],
            [-2.2, 0.1],
            [2.0, 0.0],
            [2.1, -0.1],
            [0.0, 2.0],
            [0.1, 2.2]
        ];
        let y = ndarray::array![0, 0, 1, 1, 2, 2];
        let model = LogisticRegression::fit(&x, &y, 3, &defaults()).unwrap();
        let p = model.predict_proba(&[0.0, 2.1]);
        assert_eq!(p.len(), 3);
        assert!(p[2] > p[0] && p[2] > p[1]);
        assert!(model.binary_coefficients().is_none());
    }

    #[test]
    fn test_class_missing_from_training_gets_zero() {
        let x = Array2::from_shape_fn((6, 1), |(i, _)| i as f64);
        let y = Array1::from_shape_fn(6, |i| if i < 3 { 0 } else { 2 });
        let model = LogisticRegression::fit(&x, &y, 3, &defaults()).unwrap();
        let p = model.predict_proba(&[0.0]);
        assert_eq!(p[1], 0.0);
        assert!(p[0] > p[2]);
    }

    #[test]
    fn test_single_class_is_training_error() {
        let x = ndarray::array![[1.0], [2.0]];
        let err = LogisticRegression::fit(&x, &ndarray::array![0, 0], 1, &defaults()).unwrap_err();
        assert_eq!(err.kind(), "TrainingError");
    }

    #[test]
    fn test_learning_rate_is_not_a_parameter() {
        let params: Parameters = serde_json::from_str(r#"{"learning_rate": 0.1}"#).unwrap();
        let err = LogisticParams::from_parameters(&params).unwrap_err();
        assert_eq!(err.field(), Some("parameters.learning_rate"));
    }
}
