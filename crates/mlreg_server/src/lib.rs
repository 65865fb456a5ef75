//! HTTP surface of the model registry.

pub mod api;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

pub use error::ApiError;
pub use state::AppState;

/// Build the router. Everything except `/` and `/health` sits behind the
/// API-key guard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(routes::status))
        .route("/train", post(routes::train))
        .route("/treinar", post(routes::train_legacy))
        .route("/train/async", post(routes::train_async))
        .route("/tasks", get(routes::list_tasks))
        .route("/tasks/:id", get(routes::get_task))
        .route("/tarefa/:id", get(routes::get_task))
        .route("/predict", post(routes::predict))
        .route("/prever", post(routes::predict))
        .route("/predict/batch", post(routes::predict_batch))
        .route("/prever-lote", post(routes::predict_batch))
        .route("/metrics", get(routes::metrics_history))
        .route("/metrics/current", get(routes::current_metrics))
        .route("/models", get(routes::model_history))
        .route("/models/active", get(routes::active_model))
        .route("/models/:version", get(routes::model_detail))
        .route("/treinamentos/:version", get(routes::model_detail))
        .route("/logs", get(routes::prediction_logs))
        .route("/previsoes", get(routes::prediction_logs))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_api_key))
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .fallback(middleware::not_found)
        .layer(from_fn(middleware::request_context))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Model registry listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
