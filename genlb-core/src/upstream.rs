use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::GenlbError;
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub worker_job_id: String,
    pub number: Option<u64>,
    pub node_errors: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSnapshot {
    pub running: u32,
    pub pending: u32,
}

#[derive(Deserialize)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<Value>,
    #[serde(default)]
    queue_pending: Vec<Value>,
}

/// Thin HTTP client bound to one worker's `base_url` (spec §4.6). Every
/// method translates a non-2xx response or transport failure into one of
/// the typed `GenlbError::Upstream*` variants.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build upstream http client");
        UpstreamClient { http, base_url }
    }

    pub async fn submit(&self, spec: &Value, client_sid: &str) -> Result<SubmitOutcome, GenlbError> {
        let body = json!({ "prompt": spec, "client_id": client_sid });
        let resp = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(translate_transport_error)?;
        let resp = check_status(resp).await?;
        let value: Value = resp.json().await.map_err(|e| {
            GenlbError::UpstreamRejected {
                status: 200,
                message: format!("unparseable submit response: {e}"),
            }
        })?;
        let worker_job_id = value
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or_else(|| GenlbError::UpstreamRejected {
                status: 200,
                message: "submit response missing prompt_id".to_string(),
            })?
            .to_string();
        let number = value.get("number").and_then(Value::as_u64);
        let node_errors = value.get("node_errors").cloned().unwrap_or_else(|| json!({}));
        Ok(SubmitOutcome {
            worker_job_id,
            number,
            node_errors,
        })
    }

    pub async fn cancel(&self, worker_job_id: &str) -> Result<(), GenlbError> {
        let body = json!({ "delete": [worker_job_id] });
        let resp = self
            .http
            .post(format!("{}/queue", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(translate_transport_error)?;
        check_status(resp).await?;
        Ok(())
    }

    pub async fn get_queue(&self) -> Result<QueueSnapshot, GenlbError> {
        let resp = self
            .http
            .get(format!("{}/queue", self.base_url))
            .send()
            .await
            .map_err(translate_transport_error)?;
        let resp = check_status(resp).await?;
        let parsed: QueueResponse = resp.json().await.map_err(|e| GenlbError::UpstreamRejected {
            status: 200,
            message: format!("unparseable queue response: {e}"),
        })?;
        Ok(QueueSnapshot {
            running: parsed.queue_running.len() as u32,
            pending: parsed.queue_pending.len() as u32,
        })
    }

    pub async fn get_history(&self, worker_job_id: Option<&str>) -> Result<Value, GenlbError> {
        let url = match worker_job_id {
            Some(id) => format!("{}/history/{}", self.base_url, id),
            None => format!("{}/history", self.base_url),
        };
        self.get_json_url(&url).await
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, GenlbError> {
        self.get_json_url(&format!("{}{}", self.base_url, path)).await
    }

    async fn get_json_url(&self, url: &str) -> Result<Value, GenlbError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(translate_transport_error)?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(|e| GenlbError::UpstreamRejected {
            status: 200,
            message: format!("unparseable response from {url}: {e}"),
        })
    }

    /// Streams the artifact response through untouched; the caller
    /// (FrontAPI) re-streams the body to the end-client without buffering
    /// it fully in memory.
    pub async fn get_artifact(&self, params: &[(String, String)]) -> Result<reqwest::Response, GenlbError> {
        let resp = self
            .http
            .get(format!("{}/view", self.base_url))
            .query(params)
            .send()
            .await
            .map_err(translate_transport_error)?;
        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GenlbError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let message = resp
        .text()
        .await
        .ok()
        .and_then(|body| {
            serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("error")
                        .or_else(|| v.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .or(Some(body))
        })
        .unwrap_or_default();
    Err(GenlbError::UpstreamRejected { status, message })
}

fn translate_transport_error(err: reqwest::Error) -> GenlbError {
    if err.is_timeout() {
        GenlbError::UpstreamTimeout(err.to_string())
    } else {
        GenlbError::UpstreamUnreachable(err.to_string())
    }
}

/// Per-worker keep-alive pool (spec §5): the only mutable resource shared
/// across handlers, requiring no synchronization beyond what the pooled
/// `reqwest::Client` already provides internally.
pub struct UpstreamClients {
    clients: RwLock<HashMap<String, (String, UpstreamClient)>>,
    timeout: Duration,
}

impl UpstreamClients {
    pub fn new(timeout: Duration) -> Self {
        UpstreamClients {
            clients: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub async fn get(&self, worker: &Worker) -> UpstreamClient {
        let base_url = worker.base_url();
        if let Some((cached_url, client)) = self.clients.read().await.get(&worker.name) {
            if cached_url == &base_url {
                return client.clone();
            }
        }
        let client = UpstreamClient::new(base_url.clone(), self.timeout);
        self.clients
            .write()
            .await
            .insert(worker.name.clone(), (base_url, client.clone()));
        client
    }

    pub async fn remove(&self, worker_name: &str) {
        self.clients.write().await.remove(worker_name);
    }
}
