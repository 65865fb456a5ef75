//! Evaluation metrics.
//!
//! Classification scores are macro-averaged over every label that occurs in
//! either the true or the predicted labels; a zero denominator scores 0.

use mlreg_core::{RegistryError, Result};

use crate::dataset::{Dataset, Target};
use crate::estimators::{FittedModel, RawPrediction};
use crate::types::{ClassificationMetrics, Metrics, RegressionMetrics};

pub fn regression_metrics(y_true: &[f64], y_pred: &[f64]) -> RegressionMetrics {
    let n = y_true.len().max(1) as f64;
    let mse = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / n;
    let mae = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).abs())
        .sum::<f64>()
        / n;
    RegressionMetrics {
        mse,
        rmse: mse.sqrt(),
        mae,
        r2_score: r_squared(y_true, y_pred),
    }
}

/// Coefficient of determination. A constant target scores 1.0 when it is
/// predicted exactly and 0.0 otherwise.
fn r_squared(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let n = y_true.len().max(1) as f64;
    let mean = y_true.iter().sum::<f64>() / n;
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    if ss_tot <= f64::EPSILON {
        return if ss_res <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

pub fn classification_metrics(
    y_true: &[usize],
    y_pred: &[usize],
    n_classes: usize,
) -> ClassificationMetrics {
    let n = y_true.len();
    let mut tp = vec![0usize; n_classes];
    let mut pred_count = vec![0usize; n_classes];
    let mut true_count = vec![0usize; n_classes];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        true_count[t] += 1;
        pred_count[p] += 1;
        if t == p {
            tp[t] += 1;
        }
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let labels: Vec<usize> = (0..n_classes)
        .filter(|&k| true_count[k] > 0 || pred_count[k] > 0)
        .collect();
    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for &k in &labels {
        let p = ratio(tp[k], pred_count[k]);
        let r = ratio(tp[k], true_count[k]);
        precision += p;
        recall += r;
        f1 += if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 };
    }
    let m = labels.len().max(1) as f64;

    ClassificationMetrics {
        accuracy: ratio(tp.iter().sum(), n),
        precision: precision / m,
        recall: recall / m,
        f1_score: f1 / m,
    }
}

/// Score `model` on `data`.
pub fn evaluate(model: &FittedModel, data: &Dataset) -> Result<Metrics> {
    if data.is_empty() {
        return Err(RegistryError::training("no samples to evaluate on"));
    }
    let predictions = model.predict(&data.x)?;
    match &data.target {
        Target::Continuous(y) => {
            let y_pred: Vec<f64> = predictions
                .iter()
                .map(|p| match p {
                    RawPrediction::Value(v) => *v,
                    RawPrediction::Class { .. } => f64::NAN,
                })
                .collect();
            let metrics = regression_metrics(y, &y_pred);
            if !metrics.mse.is_finite() {
                return Err(RegistryError::training("evaluation produced non-finite error"));
            }
            Ok(Metrics::Regression(metrics))
        }
        Target::Classes { classes, y } => {
            let y_pred: Vec<usize> = predictions
                .iter()
                .map(|p| match p {
                    RawPrediction::Class { index, .. } => *index,
                    RawPrediction::Value(_) => 0,
                })
                .collect();
            Ok(Metrics::Classification(classification_metrics(
                y,
                &y_pred,
                classes.len(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_perfect_regression() {
        let m = regression_metrics(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert_eq!(m.mse, 0.0);
        assert_eq!(m.mae, 0.0);
        assert_eq!(m.r2_score, 1.0);
    }

    #[test]
    fn test_regression_values() {
        let m = regression_metrics(&[3.0, -0.5, 2.0, 7.0], &[2.5, 0.0, 2.0, 8.0]);
        assert!(close(m.mse, 0.375));
        assert!(close(m.rmse, 0.375_f64.sqrt()));
        assert!(close(m.mae, 0.5));
        assert!(close(m.r2_score, 0.948_608_137_044_967_9));
    }

    #[test]
    fn test_constant_target_r2() {
        assert_eq!(r_squared(&[2.0, 2.0], &[2.0, 2.0]), 1.0);
        assert_eq!(r_squared(&[2.0, 2.0], &[1.0, 3.0]), 0.0);
    }

    #[test]
    fn test_macro_averaged_classification() {
        // classes: 0, 1, 2
        let y_true = [0, 1, 2, 0, 1, 2];
        let y_pred = [0, 2, 1, 0, 0, 1];
        let m = classification_metrics(&y_true, &y_pred, 3);
        assert!(close(m.accuracy, 2.0 / 6.0));
        // precision: c0 = 2/3, c1 = 0, c2 = 0
        assert!(close(m.precision, 2.0 / 9.0));
        // recall: c0 = 1, c1 = 0, c2 = 0
        assert!(close(m.recall, 1.0 / 3.0));
        // f1: c0 = 0.8
        assert!(close(m.f1_score, 0.8 / 3.0));
    }

    #[test]
    fn test_absent_labels_are_not_averaged() {
        let m = classification_metrics(&[0, 0, 1], &[0, 0, 1], 4);
        assert_eq!(m.precision, 1.0);
        assert_eq!(m.recall, 1.0);
        assert_eq!(m.f1_score, 1.0);
    }

    #[test]
    fn test_zero_division_scores_zero() {
        // class 1 is predicted but never correct, class 0 never predicted
        let m = classification_metrics(&[0, 0], &[1, 1], 2);
        assert_eq!(m.accuracy, 0.0);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.f1_score, 0.0);
    }
}
