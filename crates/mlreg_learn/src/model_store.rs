use chrono::{DateTime, Utc};
use mlreg_core::{RegistryError, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::estimators::FittedModel;
use crate::storage::{self, NewModelRecord, RegistryStorage};
use crate::types::{ModelRecord, Parameters};

const POINTER_FILE: &str = "current.json";

/// The model currently serving predictions.
#[derive(Debug)]
pub struct ActiveModel {
    pub record: ModelRecord,
    pub model: FittedModel,
}

/// On-disk pointer to the active blob, kept alongside the blobs so the
/// models directory is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CurrentPointer {
    version: u32,
    model_record_id: i64,
    blob_ref: String,
    activated_at: DateTime<Utc>,
}

/// Holds the active model and swaps it atomically.
///
/// Readers always see either the previous or the new model, never a mix.
/// A new model becomes visible only after its blob is on disk and its
/// record is committed.
pub struct ModelStore {
    storage: Arc<RegistryStorage>,
    models_dir: PathBuf,
    active: RwLock<Option<Arc<ActiveModel>>>,
    /// Serializes activations so versions and the pointer file move together.
    commit_lock: Mutex<()>,
}

impl ModelStore {
    /// Open the store and restore the active model recorded in the database.
    /// A missing or unreadable blob leaves the store untrained.
    pub fn open(storage: Arc<RegistryStorage>, models_dir: impl Into<PathBuf>) -> Result<Self> {
        let models_dir = models_dir.into();
        std::fs::create_dir_all(&models_dir)?;
        let store = Self {
            storage,
            models_dir,
            active: RwLock::new(None),
            commit_lock: Mutex::new(()),
        };
        store.restore()?;
        Ok(store)
    }

    fn restore(&self) -> Result<()> {
        let Some(record) = self.storage.active_model_record()? else {
            info!("No active model recorded; registry is untrained");
            return Ok(());
        };

        let model = match Self::load_blob(&self.models_dir.join(&record.blob_ref)) {
            Ok(model) => model,
            Err(e) => {
                warn!(
                    version = record.version,
                    blob = %record.blob_ref,
                    "Active model blob could not be loaded, starting untrained: {e}"
                );
                return Ok(());
            }
        };

        let pointer = self.read_pointer();
        if pointer.as_ref().map(|p| p.version) != Some(record.version) {
            warn!(
                version = record.version,
                "Model pointer file out of date, rewriting from database"
            );
            self.write_pointer(&CurrentPointer {
                version: record.version,
                model_record_id: record.id,
                blob_ref: record.blob_ref.clone(),
                activated_at: record.created_at,
            })?;
        }

        info!(
            version = record.version,
            model_type = record.model_type.as_str(),
            "Restored active model"
        );
        *self.active.write() = Some(Arc::new(ActiveModel { record, model }));
        Ok(())
    }

    /// The active model, or `NotTrained` if none has been trained yet.
    pub fn get_active(&self) -> Result<Arc<ActiveModel>> {
        self.active.read().clone().ok_or(RegistryError::NotTrained)
    }

    pub fn is_trained(&self) -> bool {
        self.active.read().is_some()
    }

    /// Model generations, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<ModelRecord>> {
        self.storage.model_records(limit)
    }

    /// One generation by version, active or not.
    pub fn record(&self, version: u32) -> Result<ModelRecord> {
        self.storage
            .model_record_by_version(version)?
            .ok_or_else(|| RegistryError::NotFound(format!("model version {version}")))
    }

    /// Persist `model` as a new generation and make it active.
    pub fn set_active(
        &self,
        model: FittedModel,
        parameters: Parameters,
        dataset_size: usize,
    ) -> Result<Arc<ActiveModel>> {
        self.set_active_with(model, parameters, dataset_size, |_, _| Ok(()))
            .map(|(active, ())| active)
    }

    /// Like [`set_active`](Self::set_active), running `within` in the same
    /// database transaction as the record insert. If `within` fails nothing
    /// changes: no record, no pointer update, no in-memory swap.
    pub fn set_active_with<T>(
        &self,
        model: FittedModel,
        parameters: Parameters,
        dataset_size: usize,
        within: impl FnOnce(&Connection, &ModelRecord) -> Result<T>,
    ) -> Result<(Arc<ActiveModel>, T)> {
        let _guard = self.commit_lock.lock();

        let bytes = model.to_bytes()?;
        let blob_ref = format!("model-{}.json", Uuid::new_v4());
        let blob_path = self.models_dir.join(&blob_ref);
        write_atomic(&blob_path, &bytes)?;

        let previous_pointer = self.read_pointer();
        let new_record = NewModelRecord {
            model_type: model.model_type,
            task: model.task,
            parameters,
            feature_names: model.feature_names.clone(),
            classes: model.classes.clone(),
            blob_ref: blob_ref.clone(),
            dataset_size,
        };

        let committed = self.storage.with_transaction(|tx| {
            let record = storage::insert_model_record(tx, &new_record)?;
            let extra = within(tx, &record)?;
            self.write_pointer(&CurrentPointer {
                version: record.version,
                model_record_id: record.id,
                blob_ref: blob_ref.clone(),
                activated_at: record.created_at,
            })?;
            Ok((record, extra))
        });

        match committed {
            Ok((record, extra)) => {
                info!(
                    version = record.version,
                    model_type = record.model_type.as_str(),
                    blob = %blob_ref,
                    "Activated model"
                );
                let active = Arc::new(ActiveModel { record, model });
                *self.active.write() = Some(Arc::clone(&active));
                Ok((active, extra))
            }
            Err(e) => {
                warn!("Model activation failed, keeping previous model: {e}");
                self.restore_pointer(previous_pointer.as_ref());
                if let Err(rm) = std::fs::remove_file(&blob_path) {
                    warn!(blob = %blob_path.display(), "Failed to remove orphan blob: {rm}");
                }
                Err(e)
            }
        }
    }

    pub fn load_blob(path: &Path) -> Result<FittedModel> {
        let bytes = std::fs::read(path).map_err(|e| {
            RegistryError::persistence(format!("read model blob {}: {e}", path.display()))
        })?;
        FittedModel::from_bytes(&bytes)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn pointer_path(&self) -> PathBuf {
        self.models_dir.join(POINTER_FILE)
    }

    fn read_pointer(&self) -> Option<CurrentPointer> {
        let bytes = std::fs::read(self.pointer_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_pointer(&self, pointer: &CurrentPointer) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(pointer)?;
        write_atomic(&self.pointer_path(), &bytes)
    }

    fn restore_pointer(&self, previous: Option<&CurrentPointer>) {
        let outcome = match previous {
            Some(pointer) => self.write_pointer(pointer),
            None => match std::fs::remove_file(self.pointer_path()) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        };
        if let Err(e) = outcome {
            warn!("Failed to restore model pointer: {e}");
        }
    }
}

/// Write to a temporary sibling, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(RegistryError::persistence(format!(
            "write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::types::{FeatureMap, ModelType, Targets, TrainingInput};

    fn fitted(slope: f64) -> FittedModel {
        let data = Dataset::from_input(&TrainingInput {
            samples: (0..4)
                .map(|i| FeatureMap::from([("x".to_string(), i as f64)]))
                .collect(),
            targets: Targets::Regression((0..4).map(|i| slope * i as f64).collect()),
        })
        .unwrap();
        FittedModel::fit(ModelType::LinearRegression, &Parameters::new(), &data).unwrap()
    }

    fn blob_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("model-"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_untrained_store_reports_not_trained() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(RegistryStorage::in_memory().unwrap());
        let store = ModelStore::open(storage, tmp.path()).unwrap();
        assert!(!store.is_trained());
        assert!(matches!(store.get_active(), Err(RegistryError::NotTrained)));
    }

    #[test]
    fn test_set_active_swaps_and_writes_pointer() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(RegistryStorage::in_memory().unwrap());
        let store = ModelStore::open(Arc::clone(&storage), tmp.path()).unwrap();

        let first = store.set_active(fitted(1.0), Parameters::new(), 4).unwrap();
        let second = store.set_active(fitted(2.0), Parameters::new(), 4).unwrap();
        assert_eq!(first.record.version, 1);
        assert_eq!(second.record.version, 2);
        assert_eq!(store.get_active().unwrap().record.version, 2);

        let pointer = store.read_pointer().unwrap();
        assert_eq!(pointer.version, 2);
        assert_eq!(pointer.blob_ref, second.record.blob_ref);
        assert_eq!(blob_files(tmp.path()).len(), 2);
    }

    #[test]
    fn test_failed_activation_keeps_previous_model() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(RegistryStorage::in_memory().unwrap());
        let store = ModelStore::open(Arc::clone(&storage), tmp.path()).unwrap();
        let first = store.set_active(fitted(1.0), Parameters::new(), 4).unwrap();

        let result = store.set_active_with(fitted(5.0), Parameters::new(), 4, |_, _| {
            Err::<(), _>(RegistryError::persistence("metrics insert failed"))
        });
        assert!(result.is_err());

        assert_eq!(store.get_active().unwrap().record.version, 1);
        assert_eq!(storage.active_model_record().unwrap().unwrap().version, 1);
        assert_eq!(store.read_pointer().unwrap().blob_ref, first.record.blob_ref);
        assert_eq!(blob_files(tmp.path()), vec![first.record.blob_ref.clone()]);
    }

    #[test]
    fn test_reopen_restores_active_model() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("registry.db");
        let models = tmp.path().join("models");
        {
            let storage = Arc::new(RegistryStorage::open(&db).unwrap());
            let store = ModelStore::open(storage, &models).unwrap();
            store.set_active(fitted(3.0), Parameters::new(), 4).unwrap();
        }
        let storage = Arc::new(RegistryStorage::open(&db).unwrap());
        let store = ModelStore::open(storage, &models).unwrap();
        let active = store.get_active().unwrap();
        assert_eq!(active.record.version, 1);
        assert_eq!(active.model.feature_names, vec!["x"]);
        let crate::estimators::RawPrediction::Value(v) =
            active.model.predict_row(&[10.0]).unwrap()
        else {
            panic!("expected a value");
        };
        assert!((v - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_corrupt_blob_starts_untrained() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("registry.db");
        let models = tmp.path().join("models");
        let blob = {
            let storage = Arc::new(RegistryStorage::open(&db).unwrap());
            let store = ModelStore::open(storage, &models).unwrap();
            store
                .set_active(fitted(3.0), Parameters::new(), 4)
                .unwrap()
                .record
                .blob_ref
                .clone()
        };
        std::fs::write(models.join(blob), b"not a model").unwrap();

        let storage = Arc::new(RegistryStorage::open(&db).unwrap());
        let store = ModelStore::open(storage, &models).unwrap();
        assert!(!store.is_trained());
    }
}
