use mlreg_core::{RegistryConfig, RegistryError, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::estimators::{self, FittedModel};
use crate::metrics_recorder::MetricsRecorder;
use crate::model_store::ModelStore;
use crate::types::{Metrics, ModelType, TaskKind, TrainingOutcome, TrainingRequest};

/// Knobs for the training pipeline, derived from [`RegistryConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSettings {
    pub eval_fraction: f64,
    pub min_split_samples: usize,
    pub split_seed: u64,
    pub default_regressor: ModelType,
    pub default_classifier: ModelType,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            eval_fraction: 0.2,
            min_split_samples: 10,
            split_seed: 42,
            default_regressor: ModelType::LinearRegression,
            default_classifier: ModelType::RandomForest,
        }
    }
}

impl TrainingSettings {
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let default_for = |name: &str, task: TaskKind| -> Result<ModelType> {
            let model_type = ModelType::parse(name)
                .map_err(|e| RegistryError::Config(e.user_message()))?;
            if !model_type.supports(task) {
                return Err(RegistryError::Config(format!(
                    "{name} cannot be the default for {}",
                    task.as_str()
                )));
            }
            Ok(model_type)
        };
        Ok(Self {
            eval_fraction: config.eval_fraction,
            min_split_samples: config.min_split_samples,
            split_seed: config.split_seed,
            default_regressor: default_for(&config.default_regressor, TaskKind::Regression)?,
            default_classifier: default_for(&config.default_classifier, TaskKind::Classification)?,
        })
    }

    pub fn default_model(&self, task: TaskKind) -> ModelType {
        match task {
            TaskKind::Regression => self.default_regressor,
            TaskKind::Classification => self.default_classifier,
        }
    }
}

/// Runs one training pass end to end: validate, split, fit, evaluate,
/// then activate the model and append its metrics in one commit.
pub struct TrainingCoordinator {
    store: Arc<ModelStore>,
    settings: TrainingSettings,
}

impl TrainingCoordinator {
    pub fn new(store: Arc<ModelStore>, settings: TrainingSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// Resolve the estimator for a request and check it against the task
    /// and its parameters. Nothing is fitted.
    pub fn resolve_model_type(&self, request: &TrainingRequest) -> Result<ModelType> {
        let task = request.input.targets.task();
        let model_type = request
            .model_type
            .unwrap_or_else(|| self.settings.default_model(task));
        if !model_type.supports(task) {
            return Err(RegistryError::validation(
                "model_type",
                format!("{} cannot be used for {}", model_type.as_str(), task.as_str()),
            ));
        }
        estimators::validate_parameters(model_type, &request.parameters)?;
        Ok(model_type)
    }

    /// Blocking: fitting a forest can take a while, so async callers should
    /// run this on a blocking thread.
    pub fn train(&self, request: TrainingRequest) -> Result<TrainingOutcome> {
        let started = Instant::now();
        let model_type = self.resolve_model_type(&request)?;
        let dataset = Dataset::from_input(&request.input)?;

        let split = dataset.split(
            self.settings.eval_fraction,
            self.settings.min_split_samples,
            self.settings.split_seed,
        );
        info!(
            model_type = model_type.as_str(),
            samples = dataset.len(),
            features = dataset.feature_names.len(),
            evaluation = split.scope.as_str(),
            "Training model"
        );

        let mut model = FittedModel::fit(model_type, &request.parameters, &split.train)
            .inspect_err(|e| warn!(model_type = model_type.as_str(), "Fit failed: {e}"))?;
        let metrics = MetricsRecorder::evaluate(&model, &split.eval)?;
        model.error_estimate = metrics.rmse();
        let insights = model.insights();

        let dataset_size = dataset.len();
        let evaluation_size = split.eval.len();
        let (active, metrics_record) = self.store.set_active_with(
            model,
            request.parameters,
            dataset_size,
            |tx, record| {
                MetricsRecorder::append_in(
                    tx,
                    record,
                    metrics,
                    dataset_size,
                    split.scope,
                    evaluation_size,
                )
            },
        )?;

        let training_time_seconds = started.elapsed().as_secs_f64();
        match metrics {
            Metrics::Regression(m) => info!(
                version = active.record.version,
                r2 = m.r2_score,
                rmse = m.rmse,
                seconds = training_time_seconds,
                "Training complete"
            ),
            Metrics::Classification(m) => info!(
                version = active.record.version,
                accuracy = m.accuracy,
                f1 = m.f1_score,
                seconds = training_time_seconds,
                "Training complete"
            ),
        }

        Ok(TrainingOutcome {
            model: active.record.clone(),
            metrics: metrics_record,
            training_time_seconds,
            insights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RegistryStorage;
    use crate::types::{FeatureMap, ParamValue, Targets, TrainingInput};

    struct Fixture {
        _tmp: tempfile::TempDir,
        storage: Arc<RegistryStorage>,
        store: Arc<ModelStore>,
        coordinator: TrainingCoordinator,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(RegistryStorage::in_memory().unwrap());
        let store = Arc::new(ModelStore::open(Arc::clone(&storage), tmp.path()).unwrap());
        let coordinator = TrainingCoordinator::new(Arc::clone(&store), TrainingSettings::default());
        Fixture {
            _tmp: tmp,
            storage,
            store,
            coordinator,
        }
    }

    fn house_prices() -> TrainingInput {
        let rows = [(50.0, 1.0, 100_000.0), (80.0, 2.0, 160_000.0), (120.0, 3.0, 240_000.0)];
        TrainingInput {
            samples: rows
                .iter()
                .map(|(area, rooms, _)| {
                    FeatureMap::from([("area".to_string(), *area), ("rooms".to_string(), *rooms)])
                })
                .collect(),
            targets: Targets::Regression(rows.iter().map(|r| r.2).collect()),
        }
    }

    fn iris_like(n: usize) -> TrainingInput {
        TrainingInput {
            samples: (0..n)
                .map(|i| {
                    let base = if i % 2 == 0 { 1.0 } else { 5.0 };
                    FeatureMap::from([
                        ("petal".to_string(), base + (i % 5) as f64 * 0.1),
                        ("sepal".to_string(), base * 2.0 - (i % 3) as f64 * 0.1),
                    ])
                })
                .collect(),
            targets: Targets::Classification(
                (0..n)
                    .map(|i| if i % 2 == 0 { "small" } else { "large" }.to_string())
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_train_three_samples_scores_perfectly() {
        let f = fixture();
        let outcome = f.coordinator.train(TrainingRequest::new(house_prices())).unwrap();
        let Metrics::Regression(m) = outcome.metrics.metrics else {
            panic!("expected regression metrics");
        };
        assert!((m.r2_score - 1.0).abs() < 1e-9);
        assert_eq!(outcome.metrics.dataset_size, 3);
        assert_eq!(outcome.model.model_type, ModelType::LinearRegression);
        assert!(outcome.insights.coefficients.is_some());
        assert!(f.store.is_trained());
    }

    #[test]
    fn test_invalid_input_leaves_state_untouched() {
        let f = fixture();
        let mut input = house_prices();
        input.targets = Targets::Regression(vec![1.0]);
        let err = f.coordinator.train(TrainingRequest::new(input)).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(!f.store.is_trained());
        assert!(f.storage.latest_metrics().unwrap().is_none());
    }

    #[test]
    fn test_failed_fit_keeps_previous_model() {
        let f = fixture();
        f.coordinator.train(TrainingRequest::new(house_prices())).unwrap();

        let single_class = TrainingInput {
            samples: house_prices().samples,
            targets: Targets::Classification(vec!["a".into(); 3]),
        };
        let err = f
            .coordinator
            .train(
                TrainingRequest::new(single_class).with_model_type(ModelType::LogisticRegression),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "TrainingError");
        assert_eq!(f.store.get_active().unwrap().record.version, 1);
        assert_eq!(f.storage.metrics_history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_incompatible_model_type_is_validation_error() {
        let f = fixture();
        let err = f
            .coordinator
            .train(TrainingRequest::new(house_prices()).with_model_type(ModelType::LogisticRegression))
            .unwrap_err();
        assert_eq!(err.field(), Some("model_type"));
    }

    #[test]
    fn test_classification_uses_holdout_for_larger_sets() {
        let f = fixture();
        let outcome = f
            .coordinator
            .train(
                TrainingRequest::new(iris_like(20))
                    .with_parameter("n_estimators", ParamValue::Int(20)),
            )
            .unwrap();
        assert_eq!(outcome.model.model_type, ModelType::RandomForest);
        assert_eq!(outcome.model.classes, vec!["large", "small"]);
        assert_eq!(outcome.metrics.evaluation, crate::types::EvaluationScope::Holdout);
        assert_eq!(outcome.metrics.evaluation_size, 4);
        assert!(outcome.insights.feature_importances.is_some());
        let Metrics::Classification(m) = outcome.metrics.metrics else {
            panic!("expected classification metrics");
        };
        assert_eq!(m.accuracy, 1.0);
    }

    #[test]
    fn test_each_run_gets_next_versions() {
        let f = fixture();
        let a = f.coordinator.train(TrainingRequest::new(house_prices())).unwrap();
        let b = f
            .coordinator
            .train(TrainingRequest::new(house_prices()).with_model_type(ModelType::DecisionTree))
            .unwrap();
        assert_eq!((a.model.version, a.metrics.version), (1, 1));
        assert_eq!((b.model.version, b.metrics.version), (2, 2));
        assert_eq!(b.metrics.model_version, 2);
    }

    #[test]
    fn test_settings_reject_incompatible_defaults() {
        let mut config = RegistryConfig::with_data_dir("/tmp/mlreg-settings");
        config.default_regressor = "logistic_regression".into();
        assert!(TrainingSettings::from_config(&config).is_err());

        let config = RegistryConfig::with_data_dir("/tmp/mlreg-settings");
        let settings = TrainingSettings::from_config(&config).unwrap();
        assert_eq!(settings, TrainingSettings::default());
    }
}
