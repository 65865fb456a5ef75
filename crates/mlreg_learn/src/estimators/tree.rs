use linfa::Dataset;
use linfa::traits::{Fit, Predict};
use linfa_trees::{DecisionTree as GiniTree, SplitQuality};
use mlreg_core::{RegistryError, Result};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};

use super::params::ParamReader;
use crate::types::Parameters;

pub(crate) type RegressionTree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct TreeParams {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Seeds bootstrap sampling and permutation importances.
    pub random_state: u64,
}

impl TreeParams {
    pub const ACCEPTED: &'static [&'static str] = &[
        "max_depth",
        "min_samples_split",
        "min_samples_leaf",
        "random_state",
    ];

    pub(crate) fn read(reader: &ParamReader<'_>) -> Result<Self> {
        Ok(Self {
            max_depth: reader.opt_usize("max_depth", 1..=256)?,
            min_samples_split: reader.usize_or("min_samples_split", 2, 2..=100_000)?,
            min_samples_leaf: reader.usize_or("min_samples_leaf", 1, 1..=100_000)?,
            random_state: reader.u64_or("random_state", 42)?,
        })
    }

    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        Self::read(&ParamReader::new(params, Self::ACCEPTED)?)
    }
}

/// What a tree is fitted against.
#[derive(Debug, Clone)]
pub(crate) enum TreeTarget {
    Continuous(Array1<f64>),
    Classes { y: Array1<usize>, n_classes: usize },
}

impl TreeTarget {
    pub fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Continuous(y) => Self::Continuous(y.select(Axis(0), rows)),
            Self::Classes { y, n_classes } => Self::Classes {
                y: y.select(Axis(0), rows),
                n_classes: *n_classes,
            },
        }
    }
}

fn fit_error(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::training(format!("decision tree: {e}"))
}

fn predict_error(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::training(format!("decision tree prediction: {e}"))
}

pub(crate) fn dense(x: &Array2<f64>) -> DenseMatrix<f64> {
    let rows: Vec<Vec<f64>> = x.outer_iter().map(|row| row.to_vec()).collect();
    DenseMatrix::from_2d_vec(&rows)
}

/// A single fitted tree: Gini splits for classes, variance splits for
/// continuous targets.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeModel {
    Classifier {
        tree: GiniTree<f64, usize>,
        n_classes: usize,
    },
    Regressor {
        tree: RegressionTree,
    },
}

impl TreeModel {
    pub(crate) fn fit(x: &Array2<f64>, target: &TreeTarget, params: &TreeParams) -> Result<Self> {
        match target {
            TreeTarget::Classes { y, n_classes } => {
                let tree = GiniTree::<f64, usize>::params()
                    .split_quality(SplitQuality::Gini)
                    .max_depth(params.max_depth)
                    .min_weight_split(params.min_samples_split as f32)
                    .min_weight_leaf(params.min_samples_leaf as f32)
                    .fit(&Dataset::new(x.clone(), y.clone()))
                    .map_err(fit_error)?;
                Ok(Self::Classifier {
                    tree,
                    n_classes: *n_classes,
                })
            }
            TreeTarget::Continuous(y) => {
                let mut parameters = DecisionTreeRegressorParameters::default()
                    .with_min_samples_split(params.min_samples_split)
                    .with_min_samples_leaf(params.min_samples_leaf);
                if let Some(depth) = params.max_depth {
                    parameters = parameters.with_max_depth(depth as u16);
                }
                let tree = RegressionTree::fit(&dense(x), &y.to_vec(), parameters)
                    .map_err(fit_error)?;
                Ok(Self::Regressor { tree })
            }
        }
    }

    /// Continuous predictions, or class indices as floats.
    pub fn predict_values(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        match self {
            Self::Classifier { tree, .. } => Ok(tree.predict(x).mapv(|c| c as f64)),
            Self::Regressor { tree } => tree
                .predict(&dense(x))
                .map(Array1::from)
                .map_err(predict_error),
        }
    }

    pub fn predict_classes(&self, x: &Array2<f64>) -> Result<Array1<usize>> {
        match self {
            Self::Classifier { tree, .. } => Ok(tree.predict(x)),
            Self::Regressor { .. } => Err(predict_error("regression tree has no classes")),
        }
    }

    /// `[value]` for regression, one-hot class probabilities otherwise.
    pub fn predict_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        let x = Array2::from_shape_vec((1, row.len()), row.to_vec()).map_err(predict_error)?;
        match self {
            Self::Classifier { tree, n_classes } => {
                let mut output = vec![0.0; *n_classes];
                if let Some(&class) = tree.predict(&x).get(0) {
                    output[class] = 1.0;
                }
                Ok(output)
            }
            Self::Regressor { .. } => Ok(self.predict_values(&x)?.to_vec()),
        }
    }

    fn impurity_importances(&self) -> Option<Vec<f64>> {
        match self {
            Self::Classifier { tree, .. } => Some(normalized(tree.feature_importance().to_vec())),
            Self::Regressor { .. } => None,
        }
    }
}

/// One tree plus its feature importances.
#[derive(Debug, Serialize, Deserialize)]
pub struct DecisionTree {
    pub model: TreeModel,
    pub importances: Vec<f64>,
}

impl DecisionTree {
    pub(crate) fn fit(x: &Array2<f64>, target: &TreeTarget, params: &TreeParams) -> Result<Self> {
        let model = TreeModel::fit(x, target, params)?;
        let importances = match (model.impurity_importances(), target) {
            (Some(importances), _) => importances,
            (None, TreeTarget::Continuous(y)) => {
                permutation_importances(x, y, params.random_state, |x| model.predict_values(x))?
            }
            (None, TreeTarget::Classes { .. }) => vec![0.0; x.ncols()],
        };
        Ok(Self { model, importances })
    }

    pub fn predict_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        self.model.predict_row(row)
    }
}

/// Scale non-negative scores to sum to one; all-zero input is returned as is.
pub(crate) fn normalized(values: Vec<f64>) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.into_iter().map(|v| v / total).collect()
    } else {
        values
    }
}

/// Increase in mean squared error when one column is shuffled, normalized
/// over all columns.
pub(crate) fn permutation_importances(
    x: &Array2<f64>,
    y: &Array1<f64>,
    seed: u64,
    predict: impl Fn(&Array2<f64>) -> Result<Array1<f64>>,
) -> Result<Vec<f64>> {
    let mse = |pred: Array1<f64>| (pred - y).mapv(|e| e * e).mean().unwrap_or(0.0);
    let baseline = mse(predict(x)?);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut scores = Vec::with_capacity(x.ncols());
    for j in 0..x.ncols() {
        let mut column = x.column(j).to_vec();
        column.shuffle(&mut rng);
        let mut shuffled = x.clone();
        shuffled.column_mut(j).assign(&Array1::from(column));
        scores.push((mse(predict(&shuffled)?) - baseline).max(0.0));
    }
    Ok(normalized(scores))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> (Array2<f64>, TreeTarget) {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 3) as f64 });
        let y = Array1::from_shape_fn(10, |i| if i < 5 { 1.0 } else { 9.0 });
        (x, TreeTarget::Continuous(y))
    }

    fn defaults() -> TreeParams {
        TreeParams::from_parameters(&Parameters::new()).unwrap()
    }

    #[test]
    fn test_regression_tree_learns_step() {
        let (x, target) = step();
        let tree = DecisionTree::fit(&x, &target, &defaults()).unwrap();
        assert_eq!(tree.predict_row(&[1.0, 1.0]).unwrap(), vec![1.0]);
        assert_eq!(tree.predict_row(&[8.0, 1.0]).unwrap(), vec![9.0]);
        assert!(tree.importances[0] > tree.importances[1]);
    }

    #[test]
    fn test_classifier_is_one_hot() {
        let x = Array2::from_shape_fn((8, 1), |(i, _)| i as f64);
        let target = TreeTarget::Classes {
            y: Array1::from_shape_fn(8, |i| usize::from(i >= 4)),
            n_classes: 2,
        };
        let tree = DecisionTree::fit(&x, &target, &defaults()).unwrap();
        assert_eq!(tree.predict_row(&[0.0]).unwrap(), vec![1.0, 0.0]);
        assert_eq!(tree.predict_row(&[7.0]).unwrap(), vec![0.0, 1.0]);
        assert_eq!(tree.importances, vec![1.0]);
    }

    #[test]
    fn test_max_depth_limits_leaves() {
        let x = Array2::from_shape_fn((9, 1), |(i, _)| i as f64);
        let target = TreeTarget::Continuous(Array1::from_shape_fn(9, |i| (i / 3) as f64));
        let leaves = |params: &TreeParams| {
            let tree = DecisionTree::fit(&x, &target, params).unwrap();
            let mut values: Vec<f64> = (0..9)
                .map(|i| tree.predict_row(&[i as f64]).unwrap()[0])
                .collect();
            values.dedup();
            values.len()
        };
        assert_eq!(leaves(&defaults()), 3);
        let shallow = TreeParams {
            max_depth: Some(1),
            ..defaults()
        };
        assert!(leaves(&shallow) < 3);
    }

    #[test]
    fn test_normalized_keeps_zeros() {
        assert_eq!(normalized(vec![0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(normalized(vec![1.0, 3.0]), vec![0.25, 0.75]);
    }
}
