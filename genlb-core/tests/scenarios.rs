use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genlb_core::{
    DispatcherConfig, DownstreamSink, Engine, EngineConfig, GenlbError, JobStatus, ProbeOutcome,
    WorkerConfig,
};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{json, Value};
use tokio::sync::Mutex;

fn worker_config(name: &str, server: &MockServer, max_queue: u32) -> WorkerConfig {
    WorkerConfig {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: server.port(),
        weight: 1,
        max_queue,
        enabled: true,
    }
}

async fn mark_healthy(engine: &Engine, name: &str) {
    engine
        .registry
        .update_health(
            name,
            ProbeOutcome::Success {
                running: 0,
                pending: 0,
            },
            1,
            3,
        )
        .await;
}

/// Scenario 1 (spec §8): single healthy worker, single submitted job —
/// expect it dispatched to that worker within one drain cycle.
#[tokio::test]
async fn single_worker_single_job_dispatches() {
    let server = MockServer::start();
    let submit_mock = server.mock(|when, then| {
        when.method(POST).path("/prompt");
        then.status(200)
            .json_body(json!({"prompt_id": "Y", "number": 1, "node_errors": {}}));
    });

    let engine = Engine::new(EngineConfig::default());
    engine
        .register_worker(worker_config("w1", &server, 10))
        .await;
    mark_healthy(&engine, "w1").await;

    let job = engine
        .submit(json!({"a": 1}), Some("c1".to_string()), None)
        .await
        .unwrap();
    engine.dispatcher.drain().await;

    let stored = engine.store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Dispatched);
    assert_eq!(stored.backend_name.as_deref(), Some("w1"));
    assert_eq!(stored.worker_job_id.as_deref(), Some("Y"));
    submit_mock.assert();
}

/// Scenario 2: with `maxQueue=1`, three back-to-back submissions dispatch
/// only the first; the rest stay pending in FIFO order until the worker's
/// load frees up.
#[tokio::test]
async fn fifo_under_saturation() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/prompt")
            .json_body_partial(json!({"prompt": {"id": 1}}).to_string());
        then.status(200)
            .json_body(json!({"prompt_id": "Y1", "number": 1, "node_errors": {}}));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/prompt")
            .json_body_partial(json!({"prompt": {"id": 2}}).to_string());
        then.status(200)
            .json_body(json!({"prompt_id": "Y2", "number": 2, "node_errors": {}}));
    });

    let engine = Engine::new(EngineConfig::default());
    engine
        .register_worker(worker_config("w1", &server, 1))
        .await;
    mark_healthy(&engine, "w1").await;

    let j1 = engine
        .submit(json!({"id": 1}), None, None)
        .await
        .unwrap();
    let j2 = engine
        .submit(json!({"id": 2}), None, None)
        .await
        .unwrap();
    let j3 = engine
        .submit(json!({"id": 3}), None, None)
        .await
        .unwrap();

    engine.dispatcher.drain().await;
    let status = engine.store.status().await;
    assert_eq!(status.dispatched, 1);
    assert_eq!(status.pending, 2);
    assert_eq!(engine.store.get(j1.id).await.unwrap().status, JobStatus::Dispatched);
    assert_eq!(engine.store.peek_oldest_pending().await.unwrap().id, j2.id);

    // J1 "completes": the worker's queue empties out, freeing the single
    // slot, which a fresh probe snapshot would reflect.
    engine
        .store
        .mark_completed("Y1", true, None)
        .await
        .unwrap();
    mark_healthy(&engine, "w1").await; // re-affirms health, no-op on class
    engine
        .registry
        .update_health(
            "w1",
            ProbeOutcome::Success {
                running: 0,
                pending: 0,
            },
            1,
            3,
        )
        .await;

    engine.dispatcher.drain().await;
    assert_eq!(engine.store.get(j2.id).await.unwrap().status, JobStatus::Dispatched);
    assert_eq!(engine.store.get(j3.id).await.unwrap().status, JobStatus::Queued);
}

/// Scenario 3: three consecutive probe failures (threshold=3) flip a
/// worker to UNHEALTHY; jobs queued during that window stay pending; the
/// next successful probe (threshold=1) wakes the dispatcher to drain them.
#[tokio::test]
async fn health_flap_parks_then_drains_on_recovery() {
    let server = MockServer::start();
    let submit_mock = server.mock(|when, then| {
        when.method(POST).path("/prompt");
        then.status(200)
            .json_body(json!({"prompt_id": "Y", "number": 1, "node_errors": {}}));
    });

    let engine = Engine::new(EngineConfig::default());
    engine
        .register_worker(worker_config("w1", &server, 10))
        .await;
    mark_healthy(&engine, "w1").await;

    for _ in 0..3 {
        engine
            .registry
            .update_health("w1", ProbeOutcome::Failure, 1, 3)
            .await;
    }
    assert!(engine.registry.get("w1").await.unwrap().health == genlb_core::HealthClass::Unhealthy);

    let job = engine.submit(json!({}), None, None).await.unwrap();
    engine.dispatcher.drain().await;
    assert_eq!(engine.store.get(job.id).await.unwrap().status, JobStatus::Queued);
    submit_mock.assert_hits(0);

    mark_healthy(&engine, "w1").await;
    engine.dispatcher.drain().await;
    assert_eq!(engine.store.get(job.id).await.unwrap().status, JobStatus::Dispatched);
}

/// Scenario 4: a worker that always rejects submission exhausts
/// `maxRetries` and the job lands in the terminal FAILED index.
#[tokio::test]
async fn retry_ceiling_reaches_terminal_failure() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/prompt");
        then.status(500).body("boom");
    });

    let mut config = EngineConfig::default();
    config.dispatcher = DispatcherConfig {
        max_retries: 2,
        retry_interval: Duration::from_secs(60),
    };
    let engine = Engine::new(config);
    engine
        .register_worker(worker_config("w1", &server, 10))
        .await;
    mark_healthy(&engine, "w1").await;

    let job = engine.submit(json!({}), None, None).await.unwrap();

    engine.dispatcher.drain().await;
    assert_eq!(engine.store.get(job.id).await.unwrap().retries, 1);
    assert_eq!(engine.store.get(job.id).await.unwrap().status, JobStatus::Queued);

    engine.dispatcher.drain().await;
    let terminal = engine.store.get(job.id).await.unwrap();
    assert_eq!(terminal.status, JobStatus::Failed);
    assert_eq!(terminal.retries, 2);
    assert!(terminal.error.is_some());
}

struct CapturingSink {
    sent: Mutex<Vec<Value>>,
}

#[async_trait]
impl DownstreamSink for CapturingSink {
    async fn send_text(&self, text: String) -> Result<(), GenlbError> {
        self.sent
            .lock()
            .await
            .push(serde_json::from_str(&text).unwrap());
        Ok(())
    }
    async fn send_binary(&self, _data: Vec<u8>) -> Result<(), GenlbError> {
        Ok(())
    }
}

/// Scenario 5: a worker-emitted progress frame addressed to the bridge
/// session is translated back to the submitting client's id and the
/// balancer's own job id before delivery.
#[tokio::test]
async fn ws_frame_translates_ids_for_known_job() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/prompt");
        then.status(200)
            .json_body(json!({"prompt_id": "Y", "number": 1, "node_errors": {}}));
    });

    let engine = Engine::new(EngineConfig::default());
    engine
        .register_worker(worker_config("w1", &server, 10))
        .await;
    mark_healthy(&engine, "w1").await;

    let job = engine
        .submit(json!({}), Some("c1".to_string()), None)
        .await
        .unwrap();
    engine.dispatcher.drain().await;

    let sink = Arc::new(CapturingSink {
        sent: Mutex::new(Vec::new()),
    });
    engine
        .ws_hub
        .connect_downstream("c1".to_string(), sink.clone())
        .await;

    let frame = json!({
        "type": "progress",
        "data": { "prompt_id": "Y", "value": 3, "max": 10, "sid": "LB_BRIDGE_w1" },
    });
    let message = tokio_tungstenite::tungstenite::Message::Text(frame.to_string());
    engine
        .ws_hub
        .handle_upstream_message("w1", message)
        .await;

    let sent = sink.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["data"]["prompt_id"], job.id.to_string());
    assert_eq!(sent[0]["data"]["sid"], "c1");
    assert_eq!(sent[0]["_backend"], "w1");
}

/// Scenario 6: cancelling a dispatched job transitions it to CANCELLED
/// immediately and issues exactly one upstream cancel call.
#[tokio::test]
async fn cancel_dispatched_job_issues_single_upstream_cancel() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/prompt");
        then.status(200)
            .json_body(json!({"prompt_id": "Y", "number": 1, "node_errors": {}}));
    });
    let cancel_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/queue")
            .json_body(json!({"delete": ["Y"]}));
        then.status(200).json_body(json!({}));
    });

    let engine = Engine::new(EngineConfig::default());
    engine
        .register_worker(worker_config("w1", &server, 10))
        .await;
    mark_healthy(&engine, "w1").await;

    let job = engine.submit(json!({}), None, None).await.unwrap();
    engine.dispatcher.drain().await;

    let cancelled = engine.cancel(job.id).await;
    assert!(cancelled);
    assert_eq!(engine.store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
    cancel_mock.assert();
}
