use mlreg_core::Result;
use std::sync::Arc;

use crate::storage::RegistryStorage;
use crate::types::{FeatureMap, PredictionLog, PredictionOutput};

/// Append-only log of served predictions, bounded by row count.
pub struct PredictionLogger {
    storage: Arc<RegistryStorage>,
    retention: usize,
}

impl PredictionLogger {
    /// `retention` is the number of newest rows kept; 0 keeps everything.
    pub fn new(storage: Arc<RegistryStorage>, retention: usize) -> Self {
        Self { storage, retention }
    }

    pub fn log(
        &self,
        model_version: u32,
        input: &FeatureMap,
        output: &PredictionOutput,
        confidence: Option<f64>,
    ) -> Result<PredictionLog> {
        self.storage
            .insert_prediction(model_version, input, output, confidence, self.retention)
    }

    /// Log a batch served by one model version in a single transaction.
    pub fn log_batch(
        &self,
        model_version: u32,
        entries: &[(&FeatureMap, &PredictionOutput, Option<f64>)],
    ) -> Result<Vec<PredictionLog>> {
        self.storage
            .insert_predictions(model_version, entries, self.retention)
    }

    /// A page of logs, most recent first.
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<PredictionLog>> {
        self.storage.prediction_logs(limit, offset)
    }

    pub fn count(&self) -> Result<usize> {
        self.storage.prediction_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn class_output(class: &str, p: f64) -> PredictionOutput {
        PredictionOutput::Classification {
            class: class.into(),
            probabilities: BTreeMap::from([(class.to_string(), p)]),
        }
    }

    #[test]
    fn test_log_then_list_most_recent_first() {
        let logger = PredictionLogger::new(Arc::new(RegistryStorage::in_memory().unwrap()), 0);
        let input = FeatureMap::from([("petal".to_string(), 1.4)]);
        let a = logger
            .log(1, &input, &class_output("setosa", 0.9), Some(0.9))
            .unwrap();
        let b = logger
            .log(2, &input, &class_output("virginica", 0.7), Some(0.7))
            .unwrap();
        assert!(b.id > a.id);

        let logs = logger.list(10, 0).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].id, b.id);
        assert_eq!(logs[0].model_version, 2);
        assert_eq!(logs[0].confidence, Some(0.7));
        assert_eq!(logs[1].input_data, input);
    }

    #[test]
    fn test_retention_bounds_row_count() {
        let logger = PredictionLogger::new(Arc::new(RegistryStorage::in_memory().unwrap()), 2);
        let input = FeatureMap::from([("petal".to_string(), 1.4)]);
        for _ in 0..5 {
            logger
                .log(1, &input, &class_output("setosa", 1.0), Some(1.0))
                .unwrap();
        }
        assert_eq!(logger.count().unwrap(), 2);
    }
}
