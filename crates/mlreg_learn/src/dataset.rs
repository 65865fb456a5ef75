use mlreg_core::{RegistryError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::types::{EvaluationScope, FeatureMap, TaskKind, Targets, TrainingInput};

/// Encoded targets, aligned row-for-row with `Dataset::x`.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Continuous(Vec<f64>),
    /// `y[i]` indexes into `classes`, which is sorted and shared by every
    /// subset of the same dataset.
    Classes { classes: Vec<String>, y: Vec<usize> },
}

impl Target {
    pub fn len(&self) -> usize {
        match self {
            Self::Continuous(y) => y.len(),
            Self::Classes { y, .. } => y.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task(&self) -> TaskKind {
        match self {
            Self::Continuous(_) => TaskKind::Regression,
            Self::Classes { .. } => TaskKind::Classification,
        }
    }

    fn subset(&self, indices: &[usize]) -> Self {
        match self {
            Self::Continuous(y) => Self::Continuous(indices.iter().map(|&i| y[i]).collect()),
            Self::Classes { classes, y } => Self::Classes {
                classes: classes.clone(),
                y: indices.iter().map(|&i| y[i]).collect(),
            },
        }
    }
}

/// A validated, column-ordered training set.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub x: Vec<Vec<f64>>,
    pub target: Target,
}

/// Result of splitting a dataset for evaluation.
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Dataset,
    pub eval: Dataset,
    pub scope: EvaluationScope,
}

impl Dataset {
    /// Validate raw samples and targets and lay them out as a feature matrix.
    ///
    /// Feature names are the sorted keys of the first sample; every other
    /// sample must carry exactly the same keys.
    pub fn from_input(input: &TrainingInput) -> Result<Self> {
        let Some(first) = input.samples.first() else {
            return Err(RegistryError::validation(
                "features",
                "at least one sample is required",
            ));
        };
        if first.is_empty() {
            return Err(RegistryError::validation(
                "features[0]",
                "sample has no features",
            ));
        }
        let feature_names: Vec<String> = first.keys().cloned().collect();

        let mut x = Vec::with_capacity(input.samples.len());
        for (i, sample) in input.samples.iter().enumerate() {
            let field = format!("features[{i}]");
            if sample.len() != feature_names.len()
                || !feature_names.iter().all(|name| sample.contains_key(name))
            {
                return Err(RegistryError::validation(
                    field,
                    format!(
                        "expected features [{}], got [{}]",
                        feature_names.join(", "),
                        sample.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                ));
            }
            if let Some((name, _)) = sample.iter().find(|(_, v)| !v.is_finite()) {
                return Err(RegistryError::validation(
                    field,
                    format!("feature '{name}' is not a finite number"),
                ));
            }
            x.push(sample.values().copied().collect());
        }

        if input.targets.len() != input.samples.len() {
            let field = match input.targets.task() {
                TaskKind::Regression => "targets",
                TaskKind::Classification => "labels",
            };
            return Err(RegistryError::validation(
                field,
                format!(
                    "got {} values for {} samples",
                    input.targets.len(),
                    input.samples.len()
                ),
            ));
        }

        let target = match &input.targets {
            Targets::Regression(values) => {
                if let Some(i) = values.iter().position(|v| !v.is_finite()) {
                    return Err(RegistryError::validation(
                        format!("targets[{i}]"),
                        "target is not a finite number",
                    ));
                }
                Target::Continuous(values.clone())
            }
            Targets::Classification(labels) => {
                if let Some(i) = labels.iter().position(|l| l.trim().is_empty()) {
                    return Err(RegistryError::validation(
                        format!("labels[{i}]"),
                        "label must not be empty",
                    ));
                }
                let mut classes = labels.clone();
                classes.sort();
                classes.dedup();
                let y = labels
                    .iter()
                    .map(|l| classes.binary_search(l).unwrap_or_default())
                    .collect();
                Target::Classes { classes, y }
            }
        };

        Ok(Self {
            feature_names,
            x,
            target,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn task(&self) -> TaskKind {
        self.target.task()
    }

    pub fn classes(&self) -> &[String] {
        match &self.target {
            Target::Classes { classes, .. } => classes,
            Target::Continuous(_) => &[],
        }
    }

    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            feature_names: self.feature_names.clone(),
            x: indices.iter().map(|&i| self.x[i].clone()).collect(),
            target: self.target.subset(indices),
        }
    }

    /// Hold out `ceil(n * eval_fraction)` samples after a seeded shuffle.
    /// Datasets smaller than `min_split_samples` are evaluated on the
    /// training set itself.
    pub fn split(&self, eval_fraction: f64, min_split_samples: usize, seed: u64) -> Split {
        let n = self.len();
        if n < min_split_samples.max(2) {
            return Split {
                train: self.clone(),
                eval: self.clone(),
                scope: EvaluationScope::TrainingSet,
            };
        }

        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let eval_len = ((n as f64 * eval_fraction).ceil() as usize).clamp(1, n - 1);
        let (eval_idx, train_idx) = indices.split_at(eval_len);
        Split {
            train: self.subset(train_idx),
            eval: self.subset(eval_idx),
            scope: EvaluationScope::Holdout,
        }
    }
}

/// Lay a single prediction input out in the model's column order.
pub fn feature_vector(feature_names: &[String], input: &FeatureMap) -> Result<Vec<f64>> {
    let missing: Vec<&str> = feature_names
        .iter()
        .filter(|name| !input.contains_key(*name))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(RegistryError::validation(
            "features",
            format!("missing features: {}", missing.join(", ")),
        ));
    }
    let unexpected: Vec<&str> = input
        .keys()
        .filter(|name| !feature_names.contains(name))
        .map(String::as_str)
        .collect();
    if !unexpected.is_empty() {
        return Err(RegistryError::validation(
            "features",
            format!(
                "unexpected features: {} (model uses {})",
                unexpected.join(", "),
                feature_names.join(", ")
            ),
        ));
    }

    feature_names
        .iter()
        .map(|name| {
            let value = input[name];
            if value.is_finite() {
                Ok(value)
            } else {
                Err(RegistryError::validation(
                    "features",
                    format!("feature '{name}' is not a finite number"),
                ))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pairs: &[(&str, f64)]) -> FeatureMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn regression_input(n: usize) -> TrainingInput {
        TrainingInput {
            samples: (0..n)
                .map(|i| sample(&[("area", i as f64), ("rooms", (i % 4) as f64)]))
                .collect(),
            targets: Targets::Regression((0..n).map(|i| i as f64 * 2.0).collect()),
        }
    }

    #[test]
    fn test_feature_names_sorted_from_first_sample() {
        let input = TrainingInput {
            samples: vec![sample(&[("b", 1.0), ("a", 2.0)])],
            targets: Targets::Regression(vec![1.0]),
        };
        let ds = Dataset::from_input(&input).unwrap();
        assert_eq!(ds.feature_names, vec!["a", "b"]);
        assert_eq!(ds.x[0], vec![2.0, 1.0]);
    }

    #[test]
    fn test_empty_samples_rejected() {
        let input = TrainingInput {
            samples: vec![],
            targets: Targets::Regression(vec![]),
        };
        let err = Dataset::from_input(&input).unwrap_err();
        assert_eq!(err.field(), Some("features"));
    }

    #[test]
    fn test_inconsistent_keys_rejected_with_index() {
        let input = TrainingInput {
            samples: vec![sample(&[("a", 1.0)]), sample(&[("b", 1.0)])],
            targets: Targets::Regression(vec![1.0, 2.0]),
        };
        let err = Dataset::from_input(&input).unwrap_err();
        assert_eq!(err.field(), Some("features[1]"));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let input = TrainingInput {
            samples: vec![sample(&[("a", 1.0)]), sample(&[("a", 2.0)])],
            targets: Targets::Classification(vec!["x".into()]),
        };
        let err = Dataset::from_input(&input).unwrap_err();
        assert_eq!(err.field(), Some("labels"));
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let input = TrainingInput {
            samples: vec![sample(&[("a", f64::NAN)])],
            targets: Targets::Regression(vec![1.0]),
        };
        assert!(Dataset::from_input(&input).is_err());

        let input = TrainingInput {
            samples: vec![sample(&[("a", 1.0)])],
            targets: Targets::Regression(vec![f64::INFINITY]),
        };
        let err = Dataset::from_input(&input).unwrap_err();
        assert_eq!(err.field(), Some("targets[0]"));
    }

    #[test]
    fn test_labels_encoded_against_sorted_classes() {
        let input = TrainingInput {
            samples: vec![
                sample(&[("a", 1.0)]),
                sample(&[("a", 2.0)]),
                sample(&[("a", 3.0)]),
            ],
            targets: Targets::Classification(vec!["dog".into(), "cat".into(), "dog".into()]),
        };
        let ds = Dataset::from_input(&input).unwrap();
        assert_eq!(ds.classes(), &["cat".to_string(), "dog".to_string()]);
        assert_eq!(
            ds.target,
            Target::Classes {
                classes: vec!["cat".into(), "dog".into()],
                y: vec![1, 0, 1],
            }
        );
    }

    #[test]
    fn test_small_dataset_evaluates_on_training_set() {
        let ds = Dataset::from_input(&regression_input(3)).unwrap();
        let split = ds.split(0.2, 10, 42);
        assert_eq!(split.scope, EvaluationScope::TrainingSet);
        assert_eq!(split.train.len(), 3);
        assert_eq!(split.eval.len(), 3);
    }

    #[test]
    fn test_split_is_seeded_and_sized() {
        let ds = Dataset::from_input(&regression_input(21)).unwrap();
        let a = ds.split(0.2, 10, 42);
        let b = ds.split(0.2, 10, 42);
        assert_eq!(a.scope, EvaluationScope::Holdout);
        assert_eq!(a.eval.len(), 5);
        assert_eq!(a.train.len(), 16);
        assert_eq!(a.eval.x, b.eval.x);
    }

    #[test]
    fn test_feature_vector_checks_names() {
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            feature_vector(&names, &sample(&[("b", 2.0), ("a", 1.0)])).unwrap(),
            vec![1.0, 2.0]
        );
        let err = feature_vector(&names, &sample(&[("a", 1.0)])).unwrap_err();
        assert!(err.to_string().contains("missing"));
        let err =
            feature_vector(&names, &sample(&[("a", 1.0), ("b", 1.0), ("c", 1.0)])).unwrap_err();
        assert!(err.to_string().contains("unexpected"));
    }
}
