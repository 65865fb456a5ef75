use chrono::{DateTime, SecondsFormat, Utc};
use mlreg_core::{RegistryError, Result, TaskStatus, TrainingTask};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::types::{
    ClassificationMetrics, EvaluationScope, FeatureMap, Metrics, MetricsRecord, ModelRecord,
    ModelType, Parameters, PredictionLog, PredictionOutput, RegressionMetrics, TaskKind,
};

/// SQLite-backed persistence for model records, metrics, prediction logs
/// and training tasks.
pub struct RegistryStorage {
    conn: Mutex<Connection>,
}

/// Fields of a model record that are known before it is inserted.
#[derive(Debug, Clone)]
pub struct NewModelRecord {
    pub model_type: ModelType,
    pub task: TaskKind,
    pub parameters: Parameters,
    pub feature_names: Vec<String>,
    pub classes: Vec<String>,
    pub blob_ref: String,
    pub dataset_size: usize,
}

#[derive(Debug, Clone)]
pub struct NewMetrics {
    pub model_record_id: i64,
    pub model_version: u32,
    pub metrics: Metrics,
    pub dataset_size: usize,
    pub evaluation: EvaluationScope,
    pub evaluation_size: usize,
}

fn persist(context: &str, e: rusqlite::Error) -> RegistryError {
    RegistryError::persistence(format!("{context}: {e}"))
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(RegistryError::from)
}

fn conversion(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_ts(row, idx).map(Some),
    }
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

fn get_count(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|e| conversion(idx, e))
}

fn get_parsed<T>(row: &Row<'_>, idx: usize, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected value '{raw}'").into(),
        )
    })
}

impl RegistryStorage {
    /// Open (or create) a registry database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| persist("open database", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| persist("enable WAL", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| persist("set synchronous", e))?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| persist("open in-memory db", e))?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS model_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version INTEGER NOT NULL UNIQUE,
                model_type TEXT NOT NULL,
                task TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT '{}',
                feature_names TEXT NOT NULL,
                classes TEXT NOT NULL DEFAULT '[]',
                blob_ref TEXT NOT NULL,
                dataset_size INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_records_single_active
                ON model_records(is_active) WHERE is_active = 1;

            CREATE TABLE IF NOT EXISTS metrics_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_record_id INTEGER NOT NULL REFERENCES model_records(id),
                model_version INTEGER NOT NULL,
                version INTEGER NOT NULL UNIQUE,
                task TEXT NOT NULL,
                accuracy REAL,
                precision_score REAL,
                recall REAL,
                f1_score REAL,
                mse REAL,
                rmse REAL,
                mae REAL,
                r2_score REAL,
                dataset_size INTEGER NOT NULL,
                evaluation TEXT NOT NULL,
                evaluation_size INTEGER NOT NULL,
                training_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS prediction_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_version INTEGER NOT NULL,
                input_data TEXT NOT NULL,
                output_data TEXT NOT NULL,
                confidence REAL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS training_tasks (
                id TEXT PRIMARY KEY,
                model_type TEXT NOT NULL,
                task TEXT NOT NULL,
                sample_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_training_tasks_finished
                ON training_tasks(status, finished_at);
            ",
        )
        .map_err(|e| persist("initialize tables", e))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RegistryError::persistence(format!("Lock poisoned: {e}")))
    }

    /// Run `f` inside one transaction. Any error rolls everything back.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| persist("begin transaction", e))?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| persist("commit transaction", e))?;
        Ok(out)
    }

    // -- Model records ------------------------------------------------------

    pub fn active_model_record(&self) -> Result<Option<ModelRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{MODEL_SELECT} WHERE is_active = 1"),
            [],
            model_record_from_row,
        )
        .optional()
        .map_err(|e| persist("load active model record", e))
    }

    /// Most recent model generations first.
    pub fn model_records(&self, limit: usize) -> Result<Vec<ModelRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{MODEL_SELECT} ORDER BY version DESC LIMIT ?1"))
            .map_err(|e| persist("prepare model query", e))?;
        let rows = stmt
            .query_map(params![limit as i64], model_record_from_row)
            .map_err(|e| persist("query model records", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| persist("read model records", e))
    }

    pub fn model_record_by_version(&self, version: u32) -> Result<Option<ModelRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{MODEL_SELECT} WHERE version = ?1"),
            params![version],
            model_record_from_row,
        )
        .optional()
        .map_err(|e| persist("load model record", e))
    }

    // -- Metrics -------------------------------------------------------------

    /// Most recent versions first.
    pub fn metrics_history(&self, limit: usize) -> Result<Vec<MetricsRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{METRICS_SELECT} ORDER BY version DESC LIMIT ?1"))
            .map_err(|e| persist("prepare metrics query", e))?;
        let rows = stmt
            .query_map(params![limit as i64], metrics_from_row)
            .map_err(|e| persist("query metrics", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| persist("read metrics", e))
    }

    /// The evaluation recorded when model generation `model_version` was trained.
    pub fn metrics_for_model(&self, model_version: u32) -> Result<Option<MetricsRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{METRICS_SELECT} WHERE model_version = ?1 ORDER BY version DESC LIMIT 1"),
            params![model_version],
            metrics_from_row,
        )
        .optional()
        .map_err(|e| persist("load model metrics", e))
    }

    pub fn latest_metrics(&self) -> Result<Option<MetricsRecord>> {
        Ok(self.metrics_history(1)?.into_iter().next())
    }

    // -- Prediction logs ---------------------------------------------------

    /// Append a prediction log, then drop rows beyond the newest `retention`
    /// (0 keeps everything).
    pub fn insert_prediction(
        &self,
        model_version: u32,
        input_data: &FeatureMap,
        output_data: &PredictionOutput,
        confidence: Option<f64>,
        retention: usize,
    ) -> Result<PredictionLog> {
        let mut logs =
            self.insert_predictions(model_version, &[(input_data, output_data, confidence)], retention)?;
        logs.pop()
            .ok_or_else(|| RegistryError::persistence("prediction log was not written"))
    }

    /// Append several prediction logs in one transaction, in order, then
    /// apply `retention` once.
    pub fn insert_predictions(
        &self,
        model_version: u32,
        entries: &[(&FeatureMap, &PredictionOutput, Option<f64>)],
        retention: usize,
    ) -> Result<Vec<PredictionLog>> {
        let timestamp = Utc::now();
        let encoded = entries
            .iter()
            .map(|(input, output, _)| Ok((to_json(input)?, to_json(output)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| persist("begin transaction", e))?;
        let mut logs = Vec::with_capacity(entries.len());
        for ((input_data, output_data, confidence), (input_json, output_json)) in
            entries.iter().zip(encoded)
        {
            tx.execute(
                "INSERT INTO prediction_logs (model_version, input_data, output_data, confidence, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![model_version, input_json, output_json, confidence, ts(&timestamp)],
            )
            .map_err(|e| persist("insert prediction log", e))?;
            logs.push(PredictionLog {
                id: tx.last_insert_rowid(),
                model_version,
                input_data: (*input_data).clone(),
                output_data: (*output_data).clone(),
                confidence: *confidence,
                timestamp,
            });
        }

        if retention > 0 {
            let trimmed = tx
                .execute(
                    "DELETE FROM prediction_logs WHERE id <= (
                        SELECT id FROM prediction_logs ORDER BY id DESC LIMIT 1 OFFSET ?1
                     )",
                    params![retention as i64],
                )
                .map_err(|e| persist("trim prediction logs", e))?;
            if trimmed > 0 {
                tracing::debug!(trimmed, retention, "Trimmed prediction logs");
            }
        }
        tx.commit().map_err(|e| persist("commit prediction log", e))?;
        Ok(logs)
    }

    /// A page of prediction logs, most recent first.
    pub fn prediction_logs(&self, limit: usize, offset: usize) -> Result<Vec<PredictionLog>> {
        let limit = i64::try_from(limit)
            .map_err(|_| RegistryError::validation("limit", "is too large"))?;
        let offset = i64::try_from(offset)
            .map_err(|_| RegistryError::validation("offset", "is too large"))?;
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, model_version, input_data, output_data, confidence, timestamp
                 FROM prediction_logs ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            )
            .map_err(|e| persist("prepare prediction query", e))?;
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                Ok(PredictionLog {
                    id: row.get(0)?,
                    model_version: row.get(1)?,
                    input_data: get_json(row, 2)?,
                    output_data: get_json(row, 3)?,
                    confidence: row.get(4)?,
                    timestamp: get_ts(row, 5)?,
                })
            })
            .map_err(|e| persist("query prediction logs", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| persist("read prediction logs", e))
    }

    pub fn prediction_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM prediction_logs", [], |row| {
            get_count(row, 0)
        })
        .map_err(|e| persist("count prediction logs", e))
    }

    // -- Training tasks ----------------------------------------------------

    /// Insert or update a task by id.
    pub fn save_task(&self, task: &TrainingTask) -> Result<()> {
        let result = task.result.as_ref().map(to_json).transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO training_tasks
                (id, model_type, task, sample_count, status, result, error, created_at, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                error = excluded.error,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at",
            params![
                task.id,
                task.model_type,
                task.task,
                task.sample_count as i64,
                task.status.as_str(),
                result,
                task.error,
                ts(&task.created_at),
                task.started_at.as_ref().map(ts),
                task.finished_at.as_ref().map(ts),
            ],
        )
        .map_err(|e| persist("save training task", e))?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TrainingTask>> {
        let conn = self.conn()?;
        conn.query_row(&format!("{TASK_SELECT} WHERE id = ?1"), params![id], task_from_row)
            .optional()
            .map_err(|e| persist("load training task", e))
    }

    /// Most recently created first.
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<TrainingTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{TASK_SELECT} ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ))
            .map_err(|e| persist("prepare task query", e))?;
        let rows = stmt
            .query_map(params![limit as i64], task_from_row)
            .map_err(|e| persist("query training tasks", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| persist("read training tasks", e))
    }

    /// Mark every pending or running task failed with `reason`. Used at
    /// startup, when no task from an earlier process can still be running.
    pub fn fail_unfinished_tasks(&self, reason: &str) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE training_tasks SET status = 'failed', error = ?1, finished_at = ?2
             WHERE status IN ('pending', 'running')",
            params![reason, ts(&Utc::now())],
        )
        .map_err(|e| persist("fail unfinished training tasks", e))
    }

    /// Delete finished tasks whose `finished_at` is before `cutoff`.
    pub fn purge_finished_tasks(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM training_tasks
             WHERE status IN ('succeeded', 'failed') AND finished_at < ?1",
            params![ts(&cutoff)],
        )
        .map_err(|e| persist("purge training tasks", e))
    }
}

// ---------------------------------------------------------------------------
// Statements usable inside a caller's transaction
// ---------------------------------------------------------------------------

/// Insert a model record as the single active generation. Its version is
/// one more than the highest existing version.
pub fn insert_model_record(conn: &Connection, new: &NewModelRecord) -> Result<ModelRecord> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM model_records",
            [],
            |row| row.get(0),
        )
        .map_err(|e| persist("next model version", e))?;
    conn.execute(
        "UPDATE model_records SET is_active = 0 WHERE is_active = 1",
        [],
    )
    .map_err(|e| persist("deactivate model records", e))?;

    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO model_records
            (version, model_type, task, parameters, feature_names, classes, blob_ref, dataset_size, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
        params![
            version,
            new.model_type.as_str(),
            new.task.as_str(),
            to_json(&new.parameters)?,
            to_json(&new.feature_names)?,
            to_json(&new.classes)?,
            new.blob_ref,
            new.dataset_size as i64,
            ts(&created_at),
        ],
    )
    .map_err(|e| persist("insert model record", e))?;

    Ok(ModelRecord {
        id: conn.last_insert_rowid(),
        version,
        model_type: new.model_type,
        task: new.task,
        parameters: new.parameters.clone(),
        feature_names: new.feature_names.clone(),
        classes: new.classes.clone(),
        blob_ref: new.blob_ref.clone(),
        dataset_size: new.dataset_size,
        is_active: true,
        created_at,
    })
}

/// Append a metrics record with version `max + 1`.
pub fn insert_metrics(conn: &Connection, new: &NewMetrics) -> Result<MetricsRecord> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM metrics_records",
            [],
            |row| row.get(0),
        )
        .map_err(|e| persist("next metrics version", e))?;

    let (accuracy, precision, recall, f1, mse, rmse, mae, r2) = match new.metrics {
        Metrics::Classification(m) => (
            Some(m.accuracy),
            Some(m.precision),
            Some(m.recall),
            Some(m.f1_score),
            None,
            None,
            None,
            None,
        ),
        Metrics::Regression(m) => (
            None,
            None,
            None,
            None,
            Some(m.mse),
            Some(m.rmse),
            Some(m.mae),
            Some(m.r2_score),
        ),
    };
    let training_date = Utc::now();
    conn.execute(
        "INSERT INTO metrics_records
            (model_record_id, model_version, version, task, accuracy, precision_score, recall, f1_score,
             mse, rmse, mae, r2_score, dataset_size, evaluation, evaluation_size, training_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            new.model_record_id,
            new.model_version,
            version,
            new.metrics.task().as_str(),
            accuracy,
            precision,
            recall,
            f1,
            mse,
            rmse,
            mae,
            r2,
            new.dataset_size as i64,
            new.evaluation.as_str(),
            new.evaluation_size as i64,
            ts(&training_date),
        ],
    )
    .map_err(|e| persist("insert metrics record", e))?;

    Ok(MetricsRecord {
        id: conn.last_insert_rowid(),
        model_record_id: new.model_record_id,
        model_version: new.model_version,
        version,
        metrics: new.metrics,
        dataset_size: new.dataset_size,
        evaluation: new.evaluation,
        evaluation_size: new.evaluation_size,
        training_date,
    })
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const MODEL_SELECT: &str = "SELECT id, version, model_type, task, parameters, feature_names, classes,
        blob_ref, dataset_size, is_active, created_at FROM model_records";

fn model_record_from_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    Ok(ModelRecord {
        id: row.get(0)?,
        version: row.get(1)?,
        model_type: get_parsed(row, 2, |s| ModelType::parse(s).ok())?,
        task: get_parsed(row, 3, TaskKind::parse)?,
        parameters: get_json(row, 4)?,
        feature_names: get_json(row, 5)?,
        classes: get_json(row, 6)?,
        blob_ref: row.get(7)?,
        dataset_size: get_count(row, 8)?,
        is_active: row.get(9)?,
        created_at: get_ts(row, 10)?,
    })
}

const METRICS_SELECT: &str = "SELECT id, model_record_id, model_version, version, task,
        accuracy, precision_score, recall, f1_score, mse, rmse, mae, r2_score,
        dataset_size, evaluation, evaluation_size, training_date FROM metrics_records";

fn metrics_from_row(row: &Row<'_>) -> rusqlite::Result<MetricsRecord> {
    let task = get_parsed(row, 4, TaskKind::parse)?;
    let value = |idx: usize| -> rusqlite::Result<f64> {
        Ok(row.get::<_, Option<f64>>(idx)?.unwrap_or(0.0))
    };
    let metrics = match task {
        TaskKind::Classification => Metrics::Classification(ClassificationMetrics {
            accuracy: value(5)?,
            precision: value(6)?,
            recall: value(7)?,
            f1_score: value(8)?,
        }),
        TaskKind::Regression => Metrics::Regression(RegressionMetrics {
            mse: value(9)?,
            rmse: value(10)?,
            mae: value(11)?,
            r2_score: value(12)?,
        }),
    };
    Ok(MetricsRecord {
        id: row.get(0)?,
        model_record_id: row.get(1)?,
        model_version: row.get(2)?,
        version: row.get(3)?,
        metrics,
        dataset_size: get_count(row, 13)?,
        evaluation: get_parsed(row, 14, EvaluationScope::parse)?,
        evaluation_size: get_count(row, 15)?,
        training_date: get_ts(row, 16)?,
    })
}

const TASK_SELECT: &str = "SELECT id, model_type, task, sample_count, status, result, error,
        created_at, started_at, finished_at FROM training_tasks";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TrainingTask> {
    let result = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| conversion(5, e))?),
        None => None,
    };
    Ok(TrainingTask {
        id: row.get(0)?,
        model_type: row.get(1)?,
        task: row.get(2)?,
        sample_count: get_count(row, 3)?,
        status: get_parsed(row, 4, TaskStatus::parse)?,
        result,
        error: row.get(6)?,
        created_at: get_ts(row, 7)?,
        started_at: get_opt_ts(row, 8)?,
        finished_at: get_opt_ts(row, 9)?,
    })
}
