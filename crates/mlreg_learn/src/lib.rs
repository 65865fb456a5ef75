pub mod coordinator;
pub mod dataset;
pub mod estimators;
pub mod metrics;
pub mod metrics_recorder;
pub mod model_store;
pub mod prediction_logger;
pub mod storage;
pub mod tasks;
pub mod types;

use mlreg_core::{RegistryConfig, RegistryError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use coordinator::{TrainingCoordinator, TrainingSettings};
use estimators::RawPrediction;
use metrics_recorder::MetricsRecorder;
use model_store::{ActiveModel, ModelStore};
use prediction_logger::PredictionLogger;
use storage::RegistryStorage;
use tasks::TrainingTasks;
pub use types::*;

/// The registry: one active model, its metrics history and the log of
/// predictions it served.
///
/// Every subsystem shares one [`RegistryStorage`]. The service is built
/// once at startup and handed to whatever serves requests; there is no
/// global state.
pub struct RegistryService {
    pub model_store: Arc<ModelStore>,
    pub metrics_recorder: MetricsRecorder,
    pub prediction_logger: PredictionLogger,
    pub coordinator: Arc<TrainingCoordinator>,
    pub tasks: Arc<TrainingTasks>,
}

impl RegistryService {
    /// Open the registry described by `config`: the database at
    /// `db_path()`, model blobs under `models_dir()`.
    pub fn open(config: &RegistryConfig) -> Result<Self> {
        let storage = Arc::new(RegistryStorage::open(&config.db_path())?);
        let settings = TrainingSettings::from_config(config)?;
        let service = Self::from_storage(
            storage,
            config.models_dir(),
            settings,
            config.prediction_log_retention,
        )?;
        info!(
            data_dir = %config.data_dir.display(),
            trained = service.model_store.is_trained(),
            "Registry opened"
        );
        Ok(service)
    }

    /// In-memory database with blobs under `models_dir` (useful for tests).
    pub fn in_memory(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage = Arc::new(RegistryStorage::in_memory()?);
        Self::from_storage(storage, models_dir, TrainingSettings::default(), 0)
    }

    pub fn from_storage(
        storage: Arc<RegistryStorage>,
        models_dir: impl Into<PathBuf>,
        settings: TrainingSettings,
        prediction_log_retention: usize,
    ) -> Result<Self> {
        let model_store = Arc::new(ModelStore::open(Arc::clone(&storage), models_dir)?);
        let coordinator = Arc::new(TrainingCoordinator::new(
            Arc::clone(&model_store),
            settings,
        ));
        let tasks = Arc::new(TrainingTasks::new(
            Arc::clone(&storage),
            Arc::clone(&coordinator),
        ));
        tasks.recover_interrupted()?;
        Ok(Self {
            metrics_recorder: MetricsRecorder::new(Arc::clone(&storage)),
            prediction_logger: PredictionLogger::new(
                Arc::clone(&storage),
                prediction_log_retention,
            ),
            tasks,
            coordinator,
            model_store,
        })
    }

    /// Train synchronously and activate the result.
    pub fn train(&self, request: TrainingRequest) -> Result<TrainingOutcome> {
        self.coordinator.train(request)
    }

    /// Predict with the active model and log the prediction. Nothing is
    /// logged when no model is trained or the input is rejected.
    pub fn predict(&self, features: &FeatureMap) -> Result<Prediction> {
        let mut predictions = self.predict_batch(std::slice::from_ref(features))?;
        predictions
            .pop()
            .ok_or_else(|| RegistryError::validation("features", "no rows to predict"))
    }

    /// Predict every row with the same active model. All rows are validated
    /// and scored before any is logged, so a bad row logs nothing.
    pub fn predict_batch(&self, rows: &[FeatureMap]) -> Result<Vec<Prediction>> {
        if rows.is_empty() {
            return Err(RegistryError::validation("features", "no rows to predict"));
        }
        let active = self.model_store.get_active()?;
        let scored = rows
            .iter()
            .enumerate()
            .map(|(i, features)| {
                score(&active, features).map_err(|e| match e {
                    RegistryError::Validation { field, message } if rows.len() > 1 => {
                        RegistryError::validation(field, format!("row {i}: {message}"))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let entries: Vec<_> = rows
            .iter()
            .zip(&scored)
            .map(|(features, (output, confidence))| (features, output, *confidence))
            .collect();
        let logs = self
            .prediction_logger
            .log_batch(active.record.version, &entries)?;
        debug!(
            version = active.record.version,
            rows = rows.len(),
            "Predictions served"
        );

        Ok(scored
            .into_iter()
            .zip(logs)
            .map(|((output, confidence), log)| Prediction {
                output,
                confidence,
                model_version: active.record.version,
                log_id: log.id,
            })
            .collect())
    }

    pub fn status(&self) -> ModelStatus {
        match self.model_store.get_active() {
            Ok(active) => ModelStatus {
                model_trained: true,
                model_type: Some(active.record.model_type),
                task: Some(active.record.task),
                version: Some(active.record.version),
                features_supported: active.record.feature_names.clone(),
                sample_count: Some(active.record.dataset_size),
                trained_at: Some(active.record.created_at),
            },
            Err(_) => ModelStatus::untrained(),
        }
    }

    pub fn metrics_history(&self, limit: usize) -> Result<Vec<MetricsRecord>> {
        self.metrics_recorder.history(limit)
    }

    pub fn current_metrics(&self) -> Result<MetricsRecord> {
        self.metrics_recorder.current()
    }

    pub fn active_model(&self) -> Result<ModelRecord> {
        Ok(self.model_store.get_active()?.record.clone())
    }

    pub fn model_history(&self, limit: usize) -> Result<Vec<ModelRecord>> {
        self.model_store.history(limit)
    }

    /// A model generation and its metrics; `NotFound` for an unknown version.
    pub fn model_detail(&self, version: u32) -> Result<ModelDetail> {
        Ok(ModelDetail {
            model: self.model_store.record(version)?,
            metrics: self.metrics_recorder.for_model(version)?,
        })
    }

    pub fn prediction_logs(&self, limit: usize, offset: usize) -> Result<Vec<PredictionLog>> {
        self.prediction_logger.list(limit, offset)
    }
}

/// Run one feature map through the active model.
fn score(active: &ActiveModel, features: &FeatureMap) -> Result<(PredictionOutput, Option<f64>)> {
    let row = dataset::feature_vector(&active.record.feature_names, features)?;
    Ok(match active.model.predict_row(&row)? {
        RawPrediction::Value(value) => {
            let interval = active
                .model
                .error_estimate
                .map(|rmse| [value - 2.0 * rmse, value + 2.0 * rmse]);
            (PredictionOutput::Regression { value, interval }, None)
        }
        RawPrediction::Class {
            index,
            probabilities,
        } => {
            let confidence = probabilities.get(index).copied();
            let probabilities: BTreeMap<String, f64> = active
                .model
                .classes
                .iter()
                .cloned()
                .zip(probabilities)
                .collect();
            let class = active.model.classes.get(index).cloned().unwrap_or_default();
            (
                PredictionOutput::Classification {
                    class,
                    probabilities,
                },
                confidence,
            )
        }
    })
}
