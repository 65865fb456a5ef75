use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use mlreg_core::{RegistryError, TrainingTask};
use mlreg_learn::{
    MetricsRecord, ModelDetail, ModelRecord, ModelStatus, PredictionLog, RegistryService,
    TrainingOutcome,
};
use serde_json::{Value, json};
use tracing::info;

use crate::api::{
    BatchPredictBody, BatchPredictResponse, LegacyTrainResponse, LimitQuery, MAX_BATCH_ROWS,
    PageQuery, PredictBody, PredictResponse, TaskAccepted, TrainBody, TrainResponse,
    bounded_limit,
};
use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError(RegistryError::validation("body", rejection.body_text()))
}

fn bad_query(rejection: QueryRejection) -> ApiError {
    ApiError(RegistryError::validation("query", rejection.body_text()))
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "mlreg",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(state): State<AppState>) -> Json<ModelStatus> {
    Json(state.service.status())
}

/// Fit on the blocking pool; the swap happens before this returns.
async fn run_training(
    state: &AppState,
    payload: Result<Json<TrainBody>, JsonRejection>,
) -> ApiResult<TrainingOutcome> {
    let Json(body) = payload.map_err(bad_body)?;
    let request = body.into_request()?;
    blocking(state, move |service| service.train(request)).await
}

pub async fn train(
    State(state): State<AppState>,
    payload: Result<Json<TrainBody>, JsonRejection>,
) -> ApiResult<Json<TrainResponse>> {
    let outcome = run_training(&state, payload).await?;
    Ok(Json(outcome.into()))
}

pub async fn train_legacy(
    State(state): State<AppState>,
    payload: Result<Json<TrainBody>, JsonRejection>,
) -> ApiResult<Json<LegacyTrainResponse>> {
    let outcome = run_training(&state, payload).await?;
    Ok(Json(outcome.into()))
}

pub async fn train_async(
    State(state): State<AppState>,
    payload: Result<Json<TrainBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    let Json(body) = payload.map_err(bad_body)?;
    let task = state.service.tasks.submit(body.into_request()?)?;
    info!(task_id = %task.id, "Accepted asynchronous training");
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            status_url: format!("/tasks/{}", task.id),
            task_id: task.id,
            status: task.status,
        }),
    ))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<TrainingTask>>> {
    let Query(query) = query.map_err(bad_query)?;
    let limit = bounded_limit(query.limit, 20, 100)?;
    Ok(Json(state.service.tasks.list(limit)?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TrainingTask>> {
    Ok(Json(state.service.tasks.get(&id)?))
}

/// Run a registry call that touches SQLite on the blocking pool.
async fn blocking<T: Send + 'static>(
    state: &AppState,
    f: impl FnOnce(&RegistryService) -> mlreg_core::Result<T> + Send + 'static,
) -> ApiResult<T> {
    let service = state.service.clone();
    let out = tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| RegistryError::persistence(format!("blocking task failed: {e}")))??;
    Ok(out)
}

pub async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<PredictBody>, JsonRejection>,
) -> ApiResult<Json<PredictResponse>> {
    let Json(body) = payload.map_err(bad_body)?;
    let features = body.into_features();
    let prediction = blocking(&state, move |service| service.predict(&features)).await?;
    Ok(Json(prediction.into()))
}

pub async fn predict_batch(
    State(state): State<AppState>,
    payload: Result<Json<BatchPredictBody>, JsonRejection>,
) -> ApiResult<Json<BatchPredictResponse>> {
    let Json(body) = payload.map_err(bad_body)?;
    let rows = body.into_rows();
    if rows.len() > MAX_BATCH_ROWS {
        return Err(ApiError(RegistryError::validation(
            "rows",
            format!("at most {MAX_BATCH_ROWS} rows per request"),
        )));
    }
    let predictions = blocking(&state, move |service| service.predict_batch(&rows)).await?;
    info!(rows = predictions.len(), "Batch prediction served");
    Ok(Json(predictions.into()))
}

pub async fn metrics_history(
    State(state): State<AppState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<MetricsRecord>>> {
    let Query(query) = query.map_err(bad_query)?;
    let limit = bounded_limit(query.limit, 10, 100)?;
    Ok(Json(state.service.metrics_history(limit)?))
}

pub async fn current_metrics(State(state): State<AppState>) -> ApiResult<Json<MetricsRecord>> {
    Ok(Json(state.service.current_metrics()?))
}

pub async fn model_history(
    State(state): State<AppState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ModelRecord>>> {
    let Query(query) = query.map_err(bad_query)?;
    let limit = bounded_limit(query.limit, 10, 100)?;
    Ok(Json(state.service.model_history(limit)?))
}

pub async fn active_model(State(state): State<AppState>) -> ApiResult<Json<ModelRecord>> {
    Ok(Json(state.service.active_model()?))
}

pub async fn model_detail(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<Json<ModelDetail>> {
    let version: u32 = version
        .parse()
        .map_err(|_| RegistryError::NotFound(format!("model version {version}")))?;
    Ok(Json(state.service.model_detail(version)?))
}

pub async fn prediction_logs(
    State(state): State<AppState>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<PredictionLog>>> {
    let Query(query) = query.map_err(bad_query)?;
    let limit = bounded_limit(query.limit, 50, 1000)?;
    let offset = query.offset()?;
    Ok(Json(state.service.prediction_logs(limit, offset)?))
}
