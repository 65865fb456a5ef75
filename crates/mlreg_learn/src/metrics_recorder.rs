use mlreg_core::{RegistryError, Result};
use rusqlite::Connection;
use std::sync::Arc;

use crate::dataset::Dataset;
use crate::estimators::FittedModel;
use crate::metrics;
use crate::model_store::ActiveModel;
use crate::storage::{self, NewMetrics, RegistryStorage};
use crate::types::{EvaluationScope, Metrics, MetricsRecord, ModelRecord};

/// Append-only history of evaluation metrics, one record per training run.
pub struct MetricsRecorder {
    storage: Arc<RegistryStorage>,
}

impl MetricsRecorder {
    pub fn new(storage: Arc<RegistryStorage>) -> Self {
        Self { storage }
    }

    /// Score a fitted model on `evaluation` without recording anything.
    pub fn evaluate(model: &FittedModel, evaluation: &Dataset) -> Result<Metrics> {
        metrics::evaluate(model, evaluation)
    }

    /// Evaluate `active` and append the result as the next metrics version.
    pub fn record(
        &self,
        active: &ActiveModel,
        evaluation: &Dataset,
        scope: EvaluationScope,
    ) -> Result<MetricsRecord> {
        let metrics = Self::evaluate(&active.model, evaluation)?;
        self.storage.with_transaction(|tx| {
            Self::append_in(
                tx,
                &active.record,
                metrics,
                active.record.dataset_size,
                scope,
                evaluation.len(),
            )
        })
    }

    /// Append inside a caller-owned transaction.
    pub(crate) fn append_in(
        conn: &Connection,
        record: &ModelRecord,
        metrics: Metrics,
        dataset_size: usize,
        evaluation: EvaluationScope,
        evaluation_size: usize,
    ) -> Result<MetricsRecord> {
        if metrics.task() != record.task {
            return Err(RegistryError::training(format!(
                "{} metrics cannot describe a {} model",
                metrics.task().as_str(),
                record.task.as_str()
            )));
        }
        storage::insert_metrics(
            conn,
            &NewMetrics {
                model_record_id: record.id,
                model_version: record.version,
                metrics,
                dataset_size,
                evaluation,
                evaluation_size,
            },
        )
    }

    /// Most recent `limit` records, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<MetricsRecord>> {
        self.storage.metrics_history(limit)
    }

    /// The record written when model generation `model_version` was trained.
    pub fn for_model(&self, model_version: u32) -> Result<Option<MetricsRecord>> {
        self.storage.metrics_for_model(model_version)
    }

    /// The latest record, or `NotTrained` when nothing has been recorded.
    pub fn current(&self) -> Result<MetricsRecord> {
        self.storage
            .latest_metrics()?
            .ok_or(RegistryError::NotTrained)
    }
}
