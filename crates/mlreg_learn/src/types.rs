use chrono::{DateTime, Utc};
use mlreg_core::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One sample: feature name to numeric value. Ordered so that feature
/// vectors are built in a stable column order.
pub type FeatureMap = BTreeMap<String, f64>;

/// Hyperparameters keyed by name.
pub type Parameters = BTreeMap<String, ParamValue>;

// ---------------------------------------------------------------------------
// Task / model kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Regression,
    Classification,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Classification => "classification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regression" => Some(Self::Regression),
            "classification" => Some(Self::Classification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    LinearRegression,
    LogisticRegression,
    DecisionTree,
    RandomForest,
}

impl ModelType {
    pub const ALL: [ModelType; 4] = [
        Self::LinearRegression,
        Self::LogisticRegression,
        Self::DecisionTree,
        Self::RandomForest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinearRegression => "linear_regression",
            Self::LogisticRegression => "logistic_regression",
            Self::DecisionTree => "decision_tree",
            Self::RandomForest => "random_forest",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == value)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|t| t.as_str()).collect();
                RegistryError::validation(
                    "model_type",
                    format!("unknown model type '{value}', expected one of {}", known.join(", ")),
                )
            })
    }

    /// Whether this estimator can be fitted for the given task.
    pub fn supports(self, task: TaskKind) -> bool {
        match self {
            Self::LinearRegression => task == TaskKind::Regression,
            Self::LogisticRegression => task == TaskKind::Classification,
            Self::DecisionTree | Self::RandomForest => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A scalar hyperparameter value as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
        }
    }
}

// ---------------------------------------------------------------------------
// Training input
// ---------------------------------------------------------------------------

/// Targets for a training run; the variant decides the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "values", rename_all = "snake_case")]
pub enum Targets {
    Regression(Vec<f64>),
    Classification(Vec<String>),
}

impl Targets {
    pub fn task(&self) -> TaskKind {
        match self {
            Self::Regression(_) => TaskKind::Regression,
            Self::Classification(_) => TaskKind::Classification,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Regression(v) => v.len(),
            Self::Classification(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingInput {
    pub samples: Vec<FeatureMap>,
    pub targets: Targets,
}

/// Everything a training run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRequest {
    pub input: TrainingInput,
    /// Falls back to the configured default for the task when absent.
    pub model_type: Option<ModelType>,
    pub parameters: Parameters,
}

impl TrainingRequest {
    pub fn new(input: TrainingInput) -> Self {
        Self {
            input,
            model_type: None,
            parameters: Parameters::new(),
        }
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = Some(model_type);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Metadata about one trained model generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: i64,
    pub version: u32,
    pub model_type: ModelType,
    pub task: TaskKind,
    pub parameters: Parameters,
    pub feature_names: Vec<String>,
    pub classes: Vec<String>,
    /// File name of the serialized model under the models directory.
    pub blob_ref: String,
    pub dataset_size: usize,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub r2_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Metrics {
    Regression(RegressionMetrics),
    Classification(ClassificationMetrics),
}

impl Metrics {
    pub fn task(&self) -> TaskKind {
        match self {
            Self::Regression(_) => TaskKind::Regression,
            Self::Classification(_) => TaskKind::Classification,
        }
    }

    pub fn rmse(&self) -> Option<f64> {
        match self {
            Self::Regression(m) => Some(m.rmse),
            Self::Classification(_) => None,
        }
    }
}

/// Which samples the metrics were computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationScope {
    Holdout,
    TrainingSet,
}

impl EvaluationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Holdout => "holdout",
            Self::TrainingSet => "training_set",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "holdout" => Some(Self::Holdout),
            "training_set" => Some(Self::TrainingSet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub id: i64,
    pub model_record_id: i64,
    pub model_version: u32,
    /// Strictly increasing across all training runs.
    pub version: u32,
    #[serde(flatten)]
    pub metrics: Metrics,
    pub dataset_size: usize,
    pub evaluation: EvaluationScope,
    pub evaluation_size: usize,
    pub training_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum PredictionOutput {
    Regression {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<[f64; 2]>,
    },
    Classification {
        class: String,
        probabilities: BTreeMap<String, f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLog {
    pub id: i64,
    pub model_version: u32,
    pub input_data: FeatureMap,
    pub output_data: PredictionOutput,
    pub confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Learned parameters worth showing to a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInsights {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coefficients: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercept: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_importances: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub model: ModelRecord,
    pub metrics: MetricsRecord,
    pub training_time_seconds: f64,
    pub insights: ModelInsights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub output: PredictionOutput,
    pub confidence: Option<f64>,
    pub model_version: u32,
    pub log_id: i64,
}

/// One model generation with the evaluation recorded when it was trained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDetail {
    pub model: ModelRecord,
    pub metrics: Option<MetricsRecord>,
}

/// Snapshot of the registry state for `/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model_trained: bool,
    pub model_type: Option<ModelType>,
    pub task: Option<TaskKind>,
    pub version: Option<u32>,
    pub features_supported: Vec<String>,
    pub sample_count: Option<usize>,
    pub trained_at: Option<DateTime<Utc>>,
}

impl ModelStatus {
    pub fn untrained() -> Self {
        Self {
            model_trained: false,
            model_type: None,
            task: None,
            version: None,
            features_supported: Vec::new(),
            sample_count: None,
            trained_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_parse() {
        assert_eq!(
            ModelType::parse("random_forest").unwrap(),
            ModelType::RandomForest
        );
        let err = ModelType::parse("svr").unwrap_err();
        assert_eq!(err.field(), Some("model_type"));
    }

    #[test]
    fn test_model_type_task_compatibility() {
        assert!(ModelType::LinearRegression.supports(TaskKind::Regression));
        assert!(!ModelType::LinearRegression.supports(TaskKind::Classification));
        assert!(ModelType::LogisticRegression.supports(TaskKind::Classification));
        assert!(!ModelType::LogisticRegression.supports(TaskKind::Regression));
        assert!(ModelType::DecisionTree.supports(TaskKind::Regression));
        assert!(ModelType::RandomForest.supports(TaskKind::Classification));
    }

    #[test]
    fn test_param_value_untagged() {
        let params: Parameters =
            serde_json::from_str(r#"{"n_estimators": 10, "alpha": 0.5, "fit_intercept": false}"#)
                .unwrap();
        assert_eq!(params["n_estimators"], ParamValue::Int(10));
        assert_eq!(params["alpha"], ParamValue::Float(0.5));
        assert_eq!(params["fit_intercept"], ParamValue::Bool(false));
    }

    #[test]
    fn test_metrics_record_flattens_tagged_metrics() {
        let record = MetricsRecord {
            id: 1,
            model_record_id: 1,
            model_version: 1,
            version: 3,
            metrics: Metrics::Regression(RegressionMetrics {
                mse: 0.0,
                rmse: 0.0,
                mae: 0.0,
                r2_score: 1.0,
            }),
            dataset_size: 3,
            evaluation: EvaluationScope::TrainingSet,
            evaluation_size: 3,
            training_date: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["task"], "regression");
        assert_eq!(json["r2_score"], 1.0);
        assert_eq!(json["evaluation"], "training_set");

        let back: MetricsRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_prediction_output_tagging() {
        let out = PredictionOutput::Classification {
            class: "spam".into(),
            probabilities: BTreeMap::from([("ham".into(), 0.2), ("spam".into(), 0.8)]),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["task"], "classification");
        assert_eq!(json["class"], "spam");

        let out = PredictionOutput::Regression {
            value: 4.0,
            interval: None,
        };
        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("interval").is_none());
    }
}
