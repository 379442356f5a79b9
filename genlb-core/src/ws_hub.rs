use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GenlbError;
use crate::job_store::JobStore;
use crate::registry::WorkerRegistry;

/// "System-class" frame types, eligible for worker-association broadcast
/// when no more specific routing target can be found (spec §4.7, step 2).
/// Kept narrow deliberately, to avoid leaking one tenant's events to
/// another's downstream socket.
const SYSTEM_FRAME_TYPES: &[&str] = &[
    "status",
    "exec_info",
    "progress",
    "executed",
    "execution_start",
    "execution_success",
    "execution_error",
    "executing",
];

/// Frame types that drive the job state machine's DISPATCHED -> RUNNING ->
/// {COMPLETED, FAILED} edges (spec §4.4). Recognized in addition to, and
/// independently of, the routing performed on the same frame.
const RUNNING_FRAME_TYPES: &[&str] = &["execution_start", "executing"];
const SUCCESS_FRAME_TYPES: &[&str] = &["executed", "execution_success"];
const ERROR_FRAME_TYPES: &[&str] = &["execution_error"];

/// A downstream (end-client) WebSocket connection. `genlb-core` has no
/// framework dependency, so the actual axum socket lives behind this trait
/// — `genlb` supplies the implementation at the FrontAPI boundary.
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), GenlbError>;
    async fn send_binary(&self, data: Vec<u8>) -> Result<(), GenlbError>;
}

enum Frame {
    Text(Value),
    Binary(Vec<u8>),
}

struct UpstreamBridge {
    cancel: CancellationToken,
}

/// Accepts downstream client sockets, maintains one upstream socket per
/// worker under a stable balancer-owned identity, and routes messages in
/// both directions with id translation (spec §4.7 — the richest module).
pub struct WsHub {
    registry: Arc<WorkerRegistry>,
    store: Arc<JobStore>,
    downstream: RwLock<HashMap<String, Arc<dyn DownstreamSink>>>,
    /// client_id -> worker names it has an observed job on.
    associations: RwLock<HashMap<String, HashSet<String>>>,
    upstream: RwLock<HashMap<String, UpstreamBridge>>,
    reconnect_backoff: Duration,
}

impl WsHub {
    pub fn new(registry: Arc<WorkerRegistry>, store: Arc<JobStore>, reconnect_backoff: Duration) -> Arc<Self> {
        Arc::new(WsHub {
            registry,
            store,
            downstream: RwLock::new(HashMap::new()),
            associations: RwLock::new(HashMap::new()),
            upstream: RwLock::new(HashMap::new()),
            reconnect_backoff,
        })
    }

    pub fn bridge_session_id(worker_name: &str) -> String {
        format!("LB_BRIDGE_{worker_name}")
    }

    pub async fn connect_downstream(&self, client_id: String, sink: Arc<dyn DownstreamSink>) {
        info!(%client_id, "downstream websocket connected");
        self.downstream.write().await.insert(client_id, sink);
    }

    pub async fn disconnect_downstream(&self, client_id: &str) {
        info!(%client_id, "downstream websocket disconnected");
        self.downstream.write().await.remove(client_id);
        self.associations.write().await.remove(client_id);
    }

    /// Starts the reconnecting upstream reader for a worker. Idempotent:
    /// at most one upstream socket per worker exists at any time (spec §3).
    pub async fn start_upstream(self: &Arc<Self>, worker_name: &str) {
        let mut guard = self.upstream.write().await;
        if guard.contains_key(worker_name) {
            return;
        }
        let cancel = CancellationToken::new();
        guard.insert(
            worker_name.to_string(),
            UpstreamBridge {
                cancel: cancel.clone(),
            },
        );
        drop(guard);

        let hub = Arc::clone(self);
        let name = worker_name.to_string();
        tokio::spawn(async move {
            hub.run_upstream_bridge(name, cancel).await;
        });
    }

    pub async fn stop_upstream(&self, worker_name: &str) {
        if let Some(bridge) = self.upstream.write().await.remove(worker_name) {
            bridge.cancel.cancel();
        }
    }

    pub async fn broadcast(&self, frame: Value) {
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };
        let targets: Vec<Arc<dyn DownstreamSink>> =
            self.downstream.read().await.values().cloned().collect();
        for sink in targets {
            if let Err(e) = sink.send_text(text.clone()).await {
                debug!(error = %e, "broadcast send failed, leaving socket for its own closer");
            }
        }
    }

    pub async fn send_to_client(&self, client_id: &str, frame: Value) {
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };
        let sink = self.downstream.read().await.get(client_id).cloned();
        if let Some(sink) = sink {
            if let Err(e) = sink.send_text(text).await {
                debug!(%client_id, error = %e, "send to client failed");
            }
        }
    }

    async fn record_association(&self, client_id: &str, worker_name: &str) {
        self.associations
            .write()
            .await
            .entry(client_id.to_string())
            .or_default()
            .insert(worker_name.to_string());
    }

    async fn associated_clients(&self, worker_name: &str) -> Vec<String> {
        self.associations
            .read()
            .await
            .iter()
            .filter(|(_, workers)| workers.contains(worker_name))
            .map(|(client_id, _)| client_id.clone())
            .collect()
    }

    async fn broadcast_to_backend_users(&self, worker_name: &str, frame: Frame) {
        let mut targets = self.associated_clients(worker_name).await;
        if targets.is_empty() {
            let is_system = matches!(
                &frame,
                Frame::Text(value) if is_system_class(value.get("type").and_then(Value::as_str))
            );
            if is_system {
                targets = self.downstream.read().await.keys().cloned().collect();
            }
        }
        match frame {
            Frame::Text(value) => {
                for client_id in &targets {
                    self.send_to_client(client_id, value.clone()).await;
                }
            }
            Frame::Binary(data) => {
                let sinks: Vec<Arc<dyn DownstreamSink>> = {
                    let guard = self.downstream.read().await;
                    targets
                        .iter()
                        .filter_map(|id| guard.get(id).cloned())
                        .collect()
                };
                for sink in sinks {
                    if let Err(e) = sink.send_binary(data.clone()).await {
                        debug!(error = %e, "binary broadcast send failed");
                    }
                }
            }
        }
    }

    /// Drives the job state machine's worker-observed edges (spec §4.4):
    /// `execution_start`/`executing` -> RUNNING, `executed`/
    /// `execution_success` -> COMPLETED, `execution_error` -> FAILED.
    /// Best-effort: a worker job id with no matching dispatched job (already
    /// terminal, or racing a cancel) is silently ignored.
    async fn advance_job_state(&self, worker_job_id: &str, frame_type: Option<&str>) {
        let Some(frame_type) = frame_type else {
            return;
        };
        if RUNNING_FRAME_TYPES.contains(&frame_type) {
            let _ = self.store.mark_running(worker_job_id).await;
        } else if SUCCESS_FRAME_TYPES.contains(&frame_type) {
            let _ = self.store.mark_completed(worker_job_id, true, None).await;
        } else if ERROR_FRAME_TYPES.contains(&frame_type) {
            let _ = self
                .store
                .mark_completed(worker_job_id, false, Some("worker reported execution_error".to_string()))
                .await;
        }
    }

    async fn handle_text_frame(&self, worker_name: &str, mut value: Value) {
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let worker_job_id = extract_id_field(&value, "prompt_id");
        let sid = extract_id_field(&value, "sid");
        let bridge_id = Self::bridge_session_id(worker_name);

        if let Value::Object(map) = &mut value {
            map.insert(
                "_backend".to_string(),
                Value::String(worker_name.to_string()),
            );
        }

        let job = match &worker_job_id {
            Some(wid) => self.store.get_by_worker_job_id(wid).await,
            None => None,
        };

        if let Some(wid) = &worker_job_id {
            self.advance_job_state(wid, frame_type.as_deref()).await;
        }

        let mut target_client = job.as_ref().and_then(|j| j.client_id.clone());
        if target_client.is_none() {
            if let Some(s) = &sid {
                if s != &bridge_id {
                    target_client = Some(s.clone());
                }
            }
        }

        let Some(target_client) = target_client else {
            if is_system_class(frame_type.as_deref()) {
                self.broadcast_to_backend_users(worker_name, Frame::Text(value))
                    .await;
            }
            return;
        };

        if let Some(job) = &job {
            set_id_field(&mut value, "prompt_id", &job.id.to_string());
        }
        set_id_field(&mut value, "sid", &target_client);

        self.send_to_client(&target_client, value).await;
        self.record_association(&target_client, worker_name).await;
    }

    /// Translates and routes one upstream frame. Public because it is the
    /// bridge's actual entry point (exercised directly by the reconnect
    /// loop below); also lets callers feed frames from an alternate
    /// transport if one is ever needed.
    pub async fn handle_upstream_message(&self, worker_name: &str, message: WsMessage) {
        match message {
            WsMessage::Binary(data) => {
                self.broadcast_to_backend_users(worker_name, Frame::Binary(data))
                    .await;
            }
            WsMessage::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => self.handle_text_frame(worker_name, value).await,
                Err(_) => debug!(worker = %worker_name, "discarded non-JSON upstream text frame"),
            },
            WsMessage::Close(_) | WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }

    async fn run_upstream_bridge(self: Arc<Self>, worker_name: String, cancel: CancellationToken) {
        info!(worker = %worker_name, "starting upstream websocket bridge");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(worker) = self.registry.get(&worker_name).await else {
                break;
            };
            let url = format!(
                "{}?clientId={}",
                worker.ws_url(),
                Self::bridge_session_id(&worker_name)
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio_tungstenite::connect_async(&url) => {
                    match result {
                        Ok((stream, _)) => {
                            info!(worker = %worker_name, "upstream websocket connected");
                            let (_, mut read) = stream.split();
                            loop {
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    next = read.next() => {
                                        match next {
                                            Some(Ok(msg)) => self.handle_upstream_message(&worker_name, msg).await,
                                            Some(Err(e)) => {
                                                debug!(worker = %worker_name, error = %e, "upstream websocket error");
                                                break;
                                            }
                                            None => break,
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!(worker = %worker_name, error = %e, "upstream websocket connect failed");
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_backoff) => {}
            }
        }
        info!(worker = %worker_name, "upstream websocket bridge stopped");
    }

    /// Cancels every upstream reader and stops accepting new downstream
    /// sockets; waits a bounded grace period before the caller forces
    /// close (spec §5).
    pub async fn shutdown(&self, grace: Duration) {
        let bridges: Vec<UpstreamBridge> = self.upstream.write().await.drain().map(|(_, b)| b).collect();
        for bridge in &bridges {
            bridge.cancel.cancel();
        }
        tokio::time::sleep(grace).await;
        let mut guard = self.downstream.write().await;
        if !guard.is_empty() {
            warn!(remaining = guard.len(), "forcing close of downstream sockets at shutdown");
            guard.clear();
        }
    }
}

fn extract_id_field(value: &Value, key: &str) -> Option<String> {
    value
        .get("data")
        .and_then(|d| d.get(key))
        .or_else(|| value.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn set_id_field(value: &mut Value, key: &str, new_val: &str) {
    let mut touched = false;
    if let Some(data) = value.get_mut("data") {
        if data.is_object() && data.get(key).is_some() {
            data[key] = Value::String(new_val.to_string());
            touched = true;
        }
    }
    if !touched && value.get(key).is_some() {
        value[key] = Value::String(new_val.to_string());
    }
}

fn is_system_class(frame_type: Option<&str>) -> bool {
    frame_type.is_some_and(|t| SYSTEM_FRAME_TYPES.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::job_store::JobStore;
    use crate::registry::WorkerRegistry;
    use std::sync::Mutex;

    struct CapturingSink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DownstreamSink for CapturingSink {
        async fn send_text(&self, text: String) -> Result<(), GenlbError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }
        async fn send_binary(&self, _data: Vec<u8>) -> Result<(), GenlbError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn translates_worker_job_id_and_sid_for_known_job() {
        let registry = WorkerRegistry::new();
        let store = JobStore::new(10);
        let hub = WsHub::new(registry, store.clone(), Duration::from_secs(2));

        let job = store
            .enqueue(serde_json::json!({}), Some("c1".to_string()), None)
            .await
            .unwrap();
        store.move_pending_to_dispatched(job.id, "w1").await.unwrap();
        store.bind_worker_job_id(job.id, "Y".to_string()).await.unwrap();

        let sink = Arc::new(CapturingSink {
            sent: Mutex::new(Vec::new()),
        });
        hub.connect_downstream("c1".to_string(), sink.clone()).await;

        let frame = serde_json::json!({
            "type": "progress",
            "data": { "prompt_id": "Y", "value": 3, "max": 10, "sid": "LB_BRIDGE_w1" },
        });
        hub.handle_text_frame("w1", frame).await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let received: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(received["data"]["prompt_id"], job.id.to_string());
        assert_eq!(received["data"]["sid"], "c1");
        assert_eq!(received["_backend"], "w1");
    }

    #[tokio::test]
    async fn execution_success_frame_drives_job_to_completed() {
        let registry = WorkerRegistry::new();
        let store = JobStore::new(10);
        let hub = WsHub::new(registry, store.clone(), Duration::from_secs(2));

        let job = store
            .enqueue(serde_json::json!({}), Some("c1".to_string()), None)
            .await
            .unwrap();
        store.move_pending_to_dispatched(job.id, "w1").await.unwrap();
        store.bind_worker_job_id(job.id, "Y".to_string()).await.unwrap();

        hub.handle_text_frame(
            "w1",
            serde_json::json!({"type": "executing", "data": {"prompt_id": "Y"}}),
        )
        .await;
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Running);

        hub.handle_text_frame(
            "w1",
            serde_json::json!({"type": "execution_success", "data": {"prompt_id": "Y"}}),
        )
        .await;
        let terminal = store.get(job.id).await.unwrap();
        assert_eq!(terminal.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn system_frame_broadcasts_when_no_association() {
        let registry = WorkerRegistry::new();
        let store = JobStore::new(10);
        let hub = WsHub::new(registry, store, Duration::from_secs(2));

        let sink = Arc::new(CapturingSink {
            sent: Mutex::new(Vec::new()),
        });
        hub.connect_downstream("c1".to_string(), sink.clone()).await;

        let frame = serde_json::json!({ "type": "status", "data": {} });
        hub.handle_text_frame("w1", frame).await;

        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_system_frame_without_association_is_dropped() {
        let registry = WorkerRegistry::new();
        let store = JobStore::new(10);
        let hub = WsHub::new(registry, store, Duration::from_secs(2));

        let sink = Arc::new(CapturingSink {
            sent: Mutex::new(Vec::new()),
        });
        hub.connect_downstream("c1".to_string(), sink.clone()).await;

        let frame = serde_json::json!({ "type": "some_unknown_type", "data": {} });
        hub.handle_text_frame("w1", frame).await;

        assert_eq!(sink.sent.lock().unwrap().len(), 0);
    }
}
