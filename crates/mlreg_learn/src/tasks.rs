use chrono::{Duration, Utc};
use mlreg_core::{RegistryError, Result, TrainingTask};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::coordinator::TrainingCoordinator;
use crate::storage::RegistryStorage;
use crate::types::{TrainingOutcome, TrainingRequest};

pub const INTERRUPTED: &str = "interrupted by restart";

/// Background training runs with a persisted status.
pub struct TrainingTasks {
    storage: Arc<RegistryStorage>,
    coordinator: Arc<TrainingCoordinator>,
}

impl TrainingTasks {
    pub fn new(storage: Arc<RegistryStorage>, coordinator: Arc<TrainingCoordinator>) -> Self {
        Self {
            storage,
            coordinator,
        }
    }

    /// Fail tasks left pending or running by a previous process. Nothing
    /// resumes them, and purging only removes finished tasks.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let failed = self.storage.fail_unfinished_tasks(INTERRUPTED)?;
        if failed > 0 {
            warn!(failed, "Marked interrupted training tasks as failed");
        }
        Ok(failed)
    }

    /// Persist a pending task and start it on the blocking pool. Requests
    /// with an unknown model type or bad parameters are rejected here rather
    /// than becoming failed tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(self: &Arc<Self>, request: TrainingRequest) -> Result<TrainingTask> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| RegistryError::Config(format!("no async runtime for training: {e}")))?;
        let model_type = self.coordinator.resolve_model_type(&request)?;

        let task = TrainingTask::new(
            model_type.as_str(),
            request.input.targets.task().as_str(),
            request.input.samples.len(),
        );
        self.storage.save_task(&task)?;
        info!(task_id = %task.id, model_type = model_type.as_str(), "Queued training task");

        let this = Arc::clone(self);
        let running = task.clone();
        handle.spawn_blocking(move || this.run(running, request));
        Ok(task)
    }

    fn run(&self, mut task: TrainingTask, request: TrainingRequest) {
        task.start();
        if let Err(e) = self.storage.save_task(&task) {
            error!(task_id = %task.id, "Failed to mark task running: {e}");
        }

        match self.coordinator.train(request) {
            Ok(outcome) => task.succeed(summary(&outcome)),
            Err(e) => task.fail(e.to_string()),
        }
        info!(
            task_id = %task.id,
            status = task.status.as_str(),
            seconds = task.duration_secs().unwrap_or_default(),
            "Training task finished"
        );
        if let Err(e) = self.storage.save_task(&task) {
            error!(task_id = %task.id, "Failed to record task result: {e}");
        }
    }

    /// `NotFound` for an unknown id.
    pub fn get(&self, id: &str) -> Result<TrainingTask> {
        self.storage
            .get_task(id)?
            .ok_or_else(|| RegistryError::NotFound(format!("training task {id}")))
    }

    /// Most recently created first.
    pub fn list(&self, limit: usize) -> Result<Vec<TrainingTask>> {
        self.storage.list_tasks(limit)
    }

    /// Delete finished tasks older than `days`.
    pub fn purge_finished(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let purged = self.storage.purge_finished_tasks(cutoff)?;
        if purged > 0 {
            info!(purged, days, "Purged finished training tasks");
        }
        Ok(purged)
    }
}

fn summary(outcome: &TrainingOutcome) -> serde_json::Value {
    json!({
        "model_version": outcome.model.version,
        "model_type": outcome.model.model_type,
        "metrics": outcome.metrics,
        "training_time_seconds": outcome.training_time_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TrainingSettings;
    use crate::model_store::ModelStore;
    use crate::types::{FeatureMap, ModelType, Targets, TrainingInput};
    use mlreg_core::TaskStatus;

    fn setup() -> (tempfile::TempDir, Arc<TrainingTasks>) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(RegistryStorage::in_memory().unwrap());
        let store = Arc::new(ModelStore::open(Arc::clone(&storage), tmp.path()).unwrap());
        let coordinator = Arc::new(TrainingCoordinator::new(store, TrainingSettings::default()));
        (tmp, Arc::new(TrainingTasks::new(storage, coordinator)))
    }

    fn input(targets: Targets) -> TrainingInput {
        TrainingInput {
            samples: (0..4)
                .map(|i| FeatureMap::from([("x".to_string(), i as f64)]))
                .collect(),
            targets,
        }
    }

    async fn wait_finished(tasks: &TrainingTasks, id: &str) -> TrainingTask {
        for _ in 0..200 {
            let task = tasks.get(id).unwrap();
            if task.is_finished() {
                return task;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task {id} did not finish");
    }

    #[tokio::test]
    async fn test_submit_runs_to_success() {
        let (_tmp, tasks) = setup();
        let task = tasks
            .submit(TrainingRequest::new(input(Targets::Regression(vec![
                1.0, 3.0, 5.0, 7.0,
            ]))))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.model_type, "linear_regression");

        let done = wait_finished(&tasks, &task.id).await;
        assert_eq!(done.status, TaskStatus::Succeeded);
        let result = done.result.unwrap();
        assert_eq!(result["model_version"], 1);
        assert_eq!(result["metrics"]["task"], "regression");
    }

    #[tokio::test]
    async fn test_failed_training_marks_task_failed() {
        let (_tmp, tasks) = setup();
        let request = TrainingRequest::new(input(Targets::Classification(vec!["a".into(); 4])))
            .with_model_type(ModelType::LogisticRegression);
        let task = tasks.submit(request).unwrap();

        let done = wait_finished(&tasks, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("two distinct classes"));
    }

    #[tokio::test]
    async fn test_bad_model_type_rejected_at_submit() {
        let (_tmp, tasks) = setup();
        let request = TrainingRequest::new(input(Targets::Regression(vec![1.0; 4])))
            .with_model_type(ModelType::LogisticRegression);
        assert!(tasks.submit(request).is_err());
        assert!(tasks.list(10).unwrap().is_empty());
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let (_tmp, tasks) = setup();
        assert!(matches!(tasks.get("nope"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_submit_outside_runtime_is_error() {
        let (_tmp, tasks) = setup();
        let request = TrainingRequest::new(input(Targets::Regression(vec![1.0; 4])));
        assert!(matches!(tasks.submit(request), Err(RegistryError::Config(_))));
    }

    #[test]
    fn test_recover_fails_interrupted_tasks() {
        let (_tmp, tasks) = setup();
        let mut running = TrainingTask::new("linear_regression", "regression", 4);
        running.start();
        tasks.storage.save_task(&running).unwrap();

        assert_eq!(tasks.recover_interrupted().unwrap(), 1);
        let task = tasks.get(&running.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(tasks.recover_interrupted().unwrap(), 0);
    }

    #[test]
    fn test_purge_keeps_recent_tasks() {
        let (_tmp, tasks) = setup();
        assert_eq!(tasks.purge_finished(30).unwrap(), 0);
    }
}
