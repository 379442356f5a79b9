use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use genlb_core::{GenlbError, JobId, Strategy, WorkerConfig};
use serde_json::{json, Value};

use crate::http_error::ApiError;
use crate::state::AppState;

/// Thin translation from HTTP to the core's own methods — no business
/// logic beyond request parsing and error-to-status mapping (spec §4.9).

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let workers = state.engine.registry.all().await;
    let total = workers.len();
    let healthy = workers
        .iter()
        .filter(|w| w.enabled && w.health == genlb_core::HealthClass::Healthy)
        .count();
    let available = workers.iter().filter(|w| w.is_available()).count();
    let idle = workers.iter().filter(|w| w.is_idle()).count();
    let queue = state.engine.store.status().await;

    Json(json!({
        "total_backends": total,
        "healthy_backends": healthy,
        "available_backends": available,
        "idle_backends": idle,
        "queue_status": queue,
        "backends": workers,
    }))
}

pub async fn list_backends(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.engine.registry.all().await))
}

pub async fn register_backend(
    State(state): State<Arc<AppState>>,
    Json(config): Json<WorkerConfig>,
) -> Json<Value> {
    let worker = state.engine.register_worker(config).await;
    Json(json!(worker))
}

pub async fn delete_backend(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.engine.remove_worker(&name).await {
        Ok(Json(json!({})))
    } else {
        Err(GenlbError::NotFound(format!("worker {name}")).into())
    }
}

pub async fn enable_backend(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.engine.registry.enable(&name).await?;
    Ok(Json(json!({})))
}

pub async fn disable_backend(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.engine.registry.disable(&name).await?;
    Ok(Json(json!({})))
}

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = &state.engine.store;
    Json(json!({
        "pending": store.snapshot_pending().await,
        "dispatched": store.snapshot_dispatched().await,
        "terminal": store.snapshot_terminal().await,
    }))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .engine
        .store
        .get(job_id)
        .await
        .ok_or_else(|| GenlbError::NotFound(format!("job {job_id}")))?;
    Ok(Json(json!(job)))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
) -> Result<Json<Value>, ApiError> {
    if state.engine.cancel(job_id).await {
        Ok(Json(json!({})))
    } else {
        Err(GenlbError::NotFound(format!("job {job_id}")).into())
    }
}

pub async fn trigger_health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.trigger_health_check().await;
    Json(json!({}))
}

pub async fn get_scheduler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "strategy": state.engine.scheduler.strategy(),
        "prefer_idle": state.engine.scheduler.prefer_idle(),
    }))
}

pub async fn set_scheduler_strategy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let strategy = Strategy::from_str(&name)
        .map_err(GenlbError::InvalidRequest)?;
    state.engine.set_scheduler_strategy(strategy);
    Ok(Json(json!({ "strategy": strategy })))
}
