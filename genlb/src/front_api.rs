use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use genlb_core::{GenlbError, JobId, JobStatus};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http_error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PromptRequest {
    pub prompt: Value,
    pub client_id: Option<String>,
    pub extra_data: Option<Value>,
}

pub async fn post_prompt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PromptRequest>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .engine
        .submit(req.prompt, req.client_id, req.extra_data)
        .await?;
    Ok(Json(json!({
        "prompt_id": job.id,
        "number": job.number,
        "node_errors": {},
    })))
}

pub async fn get_queue(State(state): State<Arc<AppState>>) -> Json<Value> {
    let dispatched = state.engine.store.snapshot_dispatched().await;
    let pending = state.engine.store.snapshot_pending().await;
    Json(json!({
        "queue_running": dispatched.iter().map(job_tuple).collect::<Vec<_>>(),
        "queue_pending": pending.iter().map(job_tuple).collect::<Vec<_>>(),
    }))
}

fn job_tuple(job: &genlb_core::Job) -> Value {
    json!([
        job.number,
        job.id,
        job.spec,
        { "client_id": job.client_id },
    ])
}

#[derive(Deserialize)]
pub struct QueueMutation {
    #[serde(default)]
    pub delete: Vec<JobId>,
    #[serde(default)]
    pub clear: bool,
}

pub async fn post_queue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueueMutation>,
) -> Json<Value> {
    for job_id in &body.delete {
        state.engine.cancel(*job_id).await;
    }
    if body.clear {
        for job in state.engine.store.snapshot_pending().await {
            state.engine.cancel(job.id).await;
        }
    }
    Json(json!({}))
}

pub async fn get_history(State(state): State<Arc<AppState>>) -> Json<Value> {
    let terminal = state.engine.store.snapshot_terminal().await;
    let mut history = serde_json::Map::new();
    for job in terminal {
        history.insert(job.id.to_string(), history_entry(&job));
    }
    Json(Value::Object(history))
}

pub async fn get_history_by_id(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .engine
        .store
        .get(job_id)
        .await
        .ok_or_else(|| GenlbError::NotFound(format!("job {job_id}")))?;

    if let (Some(backend_name), Some(worker_job_id)) = (&job.backend_name, &job.worker_job_id) {
        if let Some(worker) = state.engine.registry.get(backend_name).await {
            let client = state.engine.upstream.get(&worker).await;
            if let Ok(remote) = client.get_history(Some(worker_job_id)).await {
                return Ok(Json(rewrite_history_ids(remote, worker_job_id, &job.id.to_string())));
            }
        }
    }

    let mut history = serde_json::Map::new();
    history.insert(job_id.to_string(), history_entry(&job));
    Ok(Json(Value::Object(history)))
}

fn history_entry(job: &genlb_core::Job) -> Value {
    json!({
        "prompt": job.spec,
        "status": { "status_str": job.status, "completed": job.status == JobStatus::Completed },
        "outputs": {},
    })
}

fn rewrite_history_ids(mut remote: Value, worker_job_id: &str, balancer_job_id: &str) -> Value {
    if let Value::Object(map) = &mut remote {
        if let Some(entry) = map.remove(worker_job_id) {
            map.insert(balancer_job_id.to_string(), entry);
        }
    }
    remote
}

#[derive(Deserialize)]
pub struct ViewParams {
    pub filename: Option<String>,
    pub subfolder: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub backend: Option<String>,
}

pub async fn get_view(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ViewParams>,
) -> Result<Response, ApiError> {
    let worker = match &params.backend {
        Some(name) => state
            .engine
            .registry
            .get(name)
            .await
            .ok_or_else(|| GenlbError::NotFound(format!("worker {name}")))?,
        // Best-effort fallback (spec.md §9 open question): callers are
        // expected to learn the owning worker from `/lb/tasks/{id}` first.
        None => state
            .engine
            .registry
            .healthy()
            .await
            .into_iter()
            .next()
            .ok_or(GenlbError::NoHealthyWorker)?,
    };

    let client = state.engine.upstream.get(&worker).await;
    let mut query = Vec::new();
    if let Some(v) = &params.filename {
        query.push(("filename".to_string(), v.clone()));
    }
    if let Some(v) = &params.subfolder {
        query.push(("subfolder".to_string(), v.clone()));
    }
    if let Some(v) = &params.kind {
        query.push(("type".to_string(), v.clone()));
    }

    let upstream_resp = client.get_artifact(&query).await?;
    Ok(crate::stream::stream_upstream_response(upstream_resp).into_response())
}

async fn any_healthy_passthrough(
    state: &AppState,
    path: &str,
) -> Result<Json<Value>, ApiError> {
    let worker = state
        .engine
        .registry
        .healthy()
        .await
        .into_iter()
        .next()
        .ok_or(GenlbError::NoHealthyWorker)?;
    let client = state.engine.upstream.get(&worker).await;
    let value = client.get_json(path).await?;
    Ok(Json(value))
}

pub async fn get_object_info(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    any_healthy_passthrough(&state, "/object_info").await
}

pub async fn get_system_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    any_healthy_passthrough(&state, "/system_stats").await
}

pub async fn get_embeddings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    any_healthy_passthrough(&state, "/embeddings").await
}

pub async fn get_extensions(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    any_healthy_passthrough(&state, "/extensions").await
}
