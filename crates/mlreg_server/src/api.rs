//! Request and response bodies of the HTTP API.

use mlreg_core::{RegistryError, TaskStatus};
use mlreg_learn::{
    FeatureMap, Metrics, MetricsRecord, ModelInsights, ModelRecord, ModelType, Parameters,
    Prediction, PredictionOutput, TaskKind, Targets, TrainingInput, TrainingOutcome,
    TrainingRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /train`, `/treinar` and `/train/async`.
///
/// Regression sends numeric `targets` (or `precos`), classification sends
/// `labels`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainBody {
    pub features: Vec<FeatureMap>,
    #[serde(default, alias = "precos")]
    pub targets: Option<Vec<f64>>,
    #[serde(default)]
    pub labels: Option<Vec<Label>>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
}

/// Class labels may arrive as strings or numbers; both become strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Label {
    fn into_string(self) -> String {
        match self {
            Label::Text(s) => s,
            Label::Int(i) => i.to_string(),
            Label::Float(f) => f.to_string(),
        }
    }
}

impl TrainBody {
    pub fn into_request(self) -> Result<TrainingRequest, RegistryError> {
        let targets = match (self.targets, self.labels) {
            (Some(values), None) => Targets::Regression(values),
            (None, Some(labels)) => {
                Targets::Classification(labels.into_iter().map(Label::into_string).collect())
            }
            (Some(_), Some(_)) => {
                return Err(RegistryError::validation(
                    "targets",
                    "send either targets or labels, not both",
                ));
            }
            (None, None) => {
                return Err(RegistryError::validation(
                    "targets",
                    "targets (regression) or labels (classification) are required",
                ));
            }
        };
        let model_type = self
            .model_type
            .as_deref()
            .map(ModelType::parse)
            .transpose()?;
        Ok(TrainingRequest {
            input: TrainingInput {
                samples: self.features,
                targets,
            },
            model_type,
            parameters: self.parameters,
        })
    }
}

/// Body of `POST /predict`: either `{"features": {...}}` or the bare map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PredictBody {
    Wrapped { features: FeatureMap },
    Flat(FeatureMap),
}

impl PredictBody {
    pub fn into_features(self) -> FeatureMap {
        match self {
            PredictBody::Wrapped { features } | PredictBody::Flat(features) => features,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageQuery {
    /// `offset` defaulted to 0; SQLite takes it as a signed 64-bit value.
    pub fn offset(&self) -> Result<usize, RegistryError> {
        let offset = self.offset.unwrap_or(0);
        if i64::try_from(offset).is_err() {
            return Err(RegistryError::validation(
                "offset",
                format!("must be at most {}", i64::MAX),
            ));
        }
        Ok(offset)
    }
}

/// Body of `POST /predict/batch`: `{"rows": [...]}` or a bare list of
/// feature maps.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BatchPredictBody {
    Wrapped {
        #[serde(alias = "features", alias = "imoveis")]
        rows: Vec<FeatureMap>,
    },
    Flat(Vec<FeatureMap>),
}

impl BatchPredictBody {
    pub fn into_rows(self) -> Vec<FeatureMap> {
        match self {
            BatchPredictBody::Wrapped { rows } | BatchPredictBody::Flat(rows) => rows,
        }
    }
}

/// Most rows accepted in one batch prediction.
pub const MAX_BATCH_ROWS: usize = 1000;

/// `limit` defaulted and checked against `1..=max`.
pub fn bounded_limit(limit: Option<usize>, default: usize, max: usize) -> Result<usize, RegistryError> {
    let limit = limit.unwrap_or(default);
    if limit == 0 || limit > max {
        return Err(RegistryError::validation(
            "limit",
            format!("must be between 1 and {max}"),
        ));
    }
    Ok(limit)
}

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub message: String,
    pub model: ModelRecord,
    pub metrics: MetricsRecord,
    pub training_time_seconds: f64,
    #[serde(flatten)]
    pub insights: ModelInsights,
}

impl From<TrainingOutcome> for TrainResponse {
    fn from(outcome: TrainingOutcome) -> Self {
        Self {
            message: format!("Model version {} trained", outcome.model.version),
            model: outcome.model,
            metrics: outcome.metrics,
            training_time_seconds: outcome.training_time_seconds,
            insights: outcome.insights,
        }
    }
}

/// Flat response of the older `/treinar` route.
#[derive(Debug, Serialize)]
pub struct LegacyTrainResponse {
    pub message: String,
    pub num_amostras: usize,
    pub features_utilizadas: Vec<String>,
    pub model_version: u32,
    pub training_time_seconds: f64,
    #[serde(flatten)]
    pub metrics: Metrics,
    #[serde(flatten)]
    pub insights: ModelInsights,
}

impl From<TrainingOutcome> for LegacyTrainResponse {
    fn from(outcome: TrainingOutcome) -> Self {
        Self {
            message: "Modelo treinado com sucesso".into(),
            num_amostras: outcome.metrics.dataset_size,
            features_utilizadas: outcome.model.feature_names,
            model_version: outcome.model.version,
            training_time_seconds: outcome.training_time_seconds,
            metrics: outcome.metrics.metrics,
            insights: outcome.insights,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    /// A number for regression, the class label for classification.
    pub prediction: serde_json::Value,
    pub task: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_probabilities: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<[f64; 2]>,
    pub model_version: u32,
    pub log_id: i64,
}

impl From<Prediction> for PredictResponse {
    fn from(p: Prediction) -> Self {
        let (prediction, task, all_probabilities, interval) = match p.output {
            PredictionOutput::Regression { value, interval } => {
                (serde_json::json!(value), TaskKind::Regression, None, interval)
            }
            PredictionOutput::Classification {
                class,
                probabilities,
            } => (
                serde_json::Value::String(class),
                TaskKind::Classification,
                Some(probabilities),
                None,
            ),
        };
        Self {
            prediction,
            task,
            confidence: p.confidence,
            all_probabilities,
            interval,
            model_version: p.model_version,
            log_id: p.log_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchPredictResponse {
    pub predictions: Vec<PredictResponse>,
    pub count: usize,
    pub model_version: u32,
}

impl From<Vec<Prediction>> for BatchPredictResponse {
    fn from(predictions: Vec<Prediction>) -> Self {
        let model_version = predictions.first().map_or(0, |p| p.model_version);
        let predictions: Vec<PredictResponse> = predictions.into_iter().map(Into::into).collect();
        Self {
            count: predictions.len(),
            predictions,
            model_version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: String,
    pub status: TaskStatus,
    pub status_url: String,
}
