use mlreg_core::{RegistryError, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::params::ParamReader;
use super::tree::{TreeModel, TreeParams, TreeTarget, normalized, permutation_importances};
use crate::types::Parameters;

#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub tree: TreeParams,
}

impl ForestParams {
    pub const ACCEPTED: &'static [&'static str] = &[
        "n_estimators",
        "max_depth",
        "min_samples_split",
        "min_samples_leaf",
        "random_state",
    ];

    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let reader = ParamReader::new(params, Self::ACCEPTED)?;
        Ok(Self {
            n_estimators: reader.usize_or("n_estimators", 100, 1..=500)?,
            tree: TreeParams::read(&reader)?,
        })
    }
}

/// A tree fitted on a bootstrap sample and a subset of the columns.
#[derive(Debug, Serialize, Deserialize)]
pub struct Member {
    /// Column indices into the full feature vector, ascending.
    pub features: Vec<usize>,
    pub tree: TreeModel,
}

impl Member {
    fn columns(&self, x: &Array2<f64>) -> Array2<f64> {
        x.select(Axis(1), &self.features)
    }
}

/// Bootstrap-aggregated trees. Classification members see `sqrt(n)`
/// random columns and vote; regression members see every column and are
/// averaged.
#[derive(Debug, Serialize, Deserialize)]
pub struct RandomForest {
    pub members: Vec<Member>,
    pub n_classes: usize,
    pub importances: Vec<f64>,
}

impl RandomForest {
    pub(crate) fn fit(x: &Array2<f64>, target: &TreeTarget, params: &ForestParams) -> Result<Self> {
        let (n, d) = x.dim();
        let (max_features, n_classes) = match target {
            TreeTarget::Classes { n_classes, .. } => {
                (((d as f64).sqrt().round() as usize).clamp(1, d), *n_classes)
            }
            TreeTarget::Continuous(_) => (d, 0),
        };

        let mut rng = StdRng::seed_from_u64(params.tree.random_state);
        let mut members = Vec::with_capacity(params.n_estimators);
        for _ in 0..params.n_estimators {
            let rows: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
            let mut features = if max_features < d {
                index::sample(&mut rng, d, max_features).into_vec()
            } else {
                (0..d).collect()
            };
            features.sort_unstable();
            let sample = x.select(Axis(0), &rows).select(Axis(1), &features);
            let tree = TreeModel::fit(&sample, &target.select(&rows), &params.tree)?;
            members.push(Member { features, tree });
        }

        let mut forest = Self {
            members,
            n_classes,
            importances: Vec::new(),
        };
        forest.importances = match target {
            TreeTarget::Continuous(y) => {
                permutation_importances(x, y, params.tree.random_state, |x| forest.predict_values(x))?
            }
            TreeTarget::Classes { .. } => forest.mean_member_importances(d),
        };
        Ok(forest)
    }

    /// Mean of the member predictions.
    pub fn predict_values(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let mut total = Array1::<f64>::zeros(x.nrows());
        for member in &self.members {
            total += &member.tree.predict_values(&member.columns(x))?;
        }
        Ok(total / self.members.len().max(1) as f64)
    }

    /// `[mean]` for regression, vote shares per class otherwise.
    pub fn predict_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        let x = Array2::from_shape_vec((1, row.len()), row.to_vec())
            .map_err(|e| RegistryError::training(format!("random forest: {e}")))?;
        if self.n_classes == 0 {
            return Ok(self.predict_values(&x)?.to_vec());
        }
        let mut votes = vec![0.0; self.n_classes];
        for member in &self.members {
            if let Some(&class) = member.tree.predict_classes(&member.columns(&x))?.get(0) {
                votes[class] += 1.0;
            }
        }
        let n = self.members.len().max(1) as f64;
        Ok(votes.into_iter().map(|v| v / n).collect())
    }

    fn mean_member_importances(&self, n_features: usize) -> Vec<f64> {
        let mut total = vec![0.0; n_features];
        for member in &self.members {
            if let TreeModel::Classifier { tree, .. } = &member.tree {
                let local = normalized(tree.feature_importance().to_vec());
                for (&column, value) in member.features.iter().zip(local) {
                    total[column] += value;
                }
            }
        }
        normalized(total)
    }
}
