//! Estimators behind a single serializable [`FittedModel`].
//!
//! Fitting is delegated to linfa (least squares, logistic regression,
//! classification trees) and smartcore (regression trees); this module maps
//! request parameters onto them and keeps the fitted state in one JSON blob.

mod forest;
mod linear;
mod logistic;
pub(crate) mod params;
mod scaler;
mod tree;

pub use forest::{ForestParams, Member, RandomForest};
pub use linear::{LinearParams, LinearRegression};
pub use logistic::{LogisticParams, LogisticRegression};
pub use scaler::Scaler;
pub use tree::{DecisionTree, TreeModel, TreeParams};

use mlreg_core::{RegistryError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dataset::{Dataset, Target};
use crate::types::{ModelInsights, ModelType, Parameters, TaskKind};
use tree::TreeTarget;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "estimator", rename_all = "snake_case")]
pub enum Estimator {
    LinearRegression(LinearRegression),
    LogisticRegression(LogisticRegression),
    DecisionTree(DecisionTree),
    RandomForest(RandomForest),
}

/// Raw estimator output for one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPrediction {
    Value(f64),
    /// Arg-max class index plus one probability per class.
    Class { index: usize, probabilities: Vec<f64> },
}

/// A trained estimator together with everything needed to use it.
#[derive(Debug, Serialize, Deserialize)]
pub struct FittedModel {
    pub model_type: ModelType,
    pub task: TaskKind,
    pub feature_names: Vec<String>,
    /// Sorted class labels; empty for regression.
    pub classes: Vec<String>,
    pub estimator: Estimator,
    /// Evaluation RMSE, used for regression prediction intervals.
    #[serde(default)]
    pub error_estimate: Option<f64>,
}

/// Check `parameters` against what `model_type` accepts, without fitting.
pub fn validate_parameters(model_type: ModelType, parameters: &Parameters) -> Result<()> {
    match model_type {
        ModelType::LinearRegression => LinearParams::from_parameters(parameters).map(drop),
        ModelType::LogisticRegression => LogisticParams::from_parameters(parameters).map(drop),
        ModelType::DecisionTree => TreeParams::from_parameters(parameters).map(drop),
        ModelType::RandomForest => ForestParams::from_parameters(parameters).map(drop),
    }
}

/// Row-major samples as a dense matrix.
fn to_matrix(x: &[Vec<f64>]) -> Result<Array2<f64>> {
    let d = x.first().map_or(0, Vec::len);
    Array2::from_shape_vec((x.len(), d), x.iter().flatten().copied().collect())
        .map_err(|e| RegistryError::training(format!("feature matrix: {e}")))
}

fn tree_target(target: &Target) -> TreeTarget {
    match target {
        Target::Continuous(y) => TreeTarget::Continuous(Array1::from(y.clone())),
        Target::Classes { classes, y } => TreeTarget::Classes {
            y: Array1::from(y.clone()),
            n_classes: classes.len(),
        },
    }
}

impl FittedModel {
    pub fn fit(model_type: ModelType, parameters: &Parameters, data: &Dataset) -> Result<Self> {
        let task = data.task();
        let incompatible = || {
            RegistryError::validation(
                "model_type",
                format!("{} cannot be used for {}", model_type.as_str(), task.as_str()),
            )
        };
        if !model_type.supports(task) {
            return Err(incompatible());
        }

        let x = to_matrix(&data.x)?;
        let estimator = match (&data.target, model_type) {
            (Target::Continuous(y), ModelType::LinearRegression) => {
                let params = LinearParams::from_parameters(parameters)?;
                Estimator::LinearRegression(LinearRegression::fit(&x, &Array1::from(y.clone()), &params)?)
            }
            (Target::Classes { classes, y }, ModelType::LogisticRegression) => {
                let params = LogisticParams::from_parameters(parameters)?;
                Estimator::LogisticRegression(LogisticRegression::fit(
                    &x,
                    &Array1::from(y.clone()),
                    classes.len(),
                    &params,
                )?)
            }
            (target, ModelType::DecisionTree) => {
                let params = TreeParams::from_parameters(parameters)?;
                Estimator::DecisionTree(DecisionTree::fit(&x, &tree_target(target), &params)?)
            }
            (target, ModelType::RandomForest) => {
                let params = ForestParams::from_parameters(parameters)?;
                Estimator::RandomForest(RandomForest::fit(&x, &tree_target(target), &params)?)
            }
            _ => return Err(incompatible()),
        };

        let model = Self {
            model_type,
            task,
            feature_names: data.feature_names.clone(),
            classes: data.classes().to_vec(),
            estimator,
            error_estimate: None,
        };
        model.check_finite(data)?;
        Ok(model)
    }

    fn check_finite(&self, data: &Dataset) -> Result<()> {
        let params_finite = match &self.estimator {
            Estimator::LinearRegression(m) => {
                m.intercept.is_finite() && m.coefficients.iter().all(|c| c.is_finite())
            }
            Estimator::LogisticRegression(m) => {
                m.bias.iter().all(|b| b.is_finite())
                    && m.weights.iter().flatten().all(|w| w.is_finite())
            }
            Estimator::DecisionTree(_) | Estimator::RandomForest(_) => true,
        };
        let mut outputs_finite = true;
        for row in &data.x {
            outputs_finite &= match self.predict_row(row)? {
                RawPrediction::Value(v) => v.is_finite(),
                RawPrediction::Class { probabilities, .. } => {
                    probabilities.iter().all(|p| p.is_finite())
                }
            };
        }
        if params_finite && outputs_finite {
            Ok(())
        } else {
            Err(RegistryError::training(format!(
                "{} produced non-finite values; check the scale of features and targets",
                self.model_type.as_str()
            )))
        }
    }

    /// Predict one row given in `feature_names` order.
    pub fn predict_row(&self, row: &[f64]) -> Result<RawPrediction> {
        let output = match &self.estimator {
            Estimator::LinearRegression(m) => return Ok(RawPrediction::Value(m.predict_row(row))),
            Estimator::LogisticRegression(m) => m.predict_proba(row),
            Estimator::DecisionTree(m) => m.predict_row(row)?,
            Estimator::RandomForest(m) => m.predict_row(row)?,
        };
        Ok(match self.task {
            TaskKind::Regression => RawPrediction::Value(output.first().copied().unwrap_or(0.0)),
            TaskKind::Classification => {
                let index = output
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(i, _)| i);
                RawPrediction::Class {
                    index,
                    probabilities: output,
                }
            }
        })
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<RawPrediction>> {
        x.iter().map(|row| self.predict_row(row)).collect()
    }

    /// Coefficients in original feature units, or feature importances.
    pub fn insights(&self) -> ModelInsights {
        let named = |values: &[f64]| -> BTreeMap<String, f64> {
            self.feature_names.iter().cloned().zip(values.iter().copied()).collect()
        };
        match &self.estimator {
            Estimator::LinearRegression(m) => ModelInsights {
                coefficients: Some(named(&m.coefficients)),
                intercept: Some(m.intercept),
                feature_importances: None,
            },
            Estimator::LogisticRegression(m) => ModelInsights {
                coefficients: m.binary_coefficients().map(|c| named(&c)),
                ..ModelInsights::default()
            },
            Estimator::DecisionTree(m) => ModelInsights {
                feature_importances: Some(named(&m.importances)),
                ..ModelInsights::default()
            },
            Estimator::RandomForest(m) => ModelInsights {
                feature_importances: Some(named(&m.importances)),
                ..ModelInsights::default()
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RegistryError::serialization(format!("encode model: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RegistryError::serialization(format!("decode model: {e}")))
    }
}
