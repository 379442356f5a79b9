//! Domain logic for the generative-worker reverse-proxy load balancer:
//! worker bookkeeping, health probing, scheduling, job tracking, dispatch,
//! and WebSocket fan-in/fan-out. Framework-agnostic — the HTTP/WS surface
//! lives in the `genlb` binary crate.

pub mod dispatcher;
pub mod error;
pub mod health_prober;
pub mod job;
pub mod job_store;
pub mod registry;
pub mod scheduler;
pub mod upstream;
pub mod worker;
pub mod ws_hub;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::GenlbError;
pub use health_prober::{HealthCheckConfig, HealthProber};
pub use job::{CancelOutcome, Job, JobId, JobStatus};
pub use job_store::{JobStore, QueueStatus};
pub use registry::WorkerRegistry;
pub use scheduler::{Scheduler, Strategy};
pub use upstream::{UpstreamClient, UpstreamClients};
pub use worker::{HealthClass, ProbeOutcome, Worker, WorkerConfig};
pub use ws_hub::{DownstreamSink, WsHub};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub queue_max_size: usize,
    pub terminal_cap: usize,
    pub upstream_timeout: Duration,
    pub ws_reconnect_backoff: Duration,
    pub health_check: HealthCheckConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler_strategy: Strategy,
    pub prefer_idle: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            queue_max_size: 1000,
            terminal_cap: 1000,
            upstream_timeout: Duration::from_secs(30),
            ws_reconnect_backoff: Duration::from_secs(2),
            health_check: HealthCheckConfig::default(),
            dispatcher: DispatcherConfig::default(),
            scheduler_strategy: Strategy::LeastBusy,
            prefer_idle: false,
        }
    }
}

/// Wires C1–C7 together and exposes the handful of operations the HTTP
/// layer actually needs (submit, cancel, inspect, register/health-check a
/// worker, change scheduler strategy). Cloning is cheap: every field is an
/// `Arc`.
#[derive(Clone)]
pub struct Engine {
    pub registry: Arc<WorkerRegistry>,
    pub store: Arc<JobStore>,
    pub scheduler: Arc<Scheduler>,
    pub upstream: Arc<UpstreamClients>,
    pub ws_hub: Arc<WsHub>,
    pub health_prober: Arc<HealthProber>,
    pub dispatcher: Arc<Dispatcher>,
    dispatch_wake: Arc<Notify>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let registry = WorkerRegistry::new();
        let store = JobStore::with_terminal_cap(config.queue_max_size, config.terminal_cap);
        let scheduler = Scheduler::new(config.scheduler_strategy, config.prefer_idle);
        let upstream = Arc::new(UpstreamClients::new(config.upstream_timeout));
        let ws_hub = WsHub::new(registry.clone(), store.clone(), config.ws_reconnect_backoff);
        let dispatch_wake = Arc::new(Notify::new());

        let health_prober = HealthProber::new(
            registry.clone(),
            upstream.clone(),
            ws_hub.clone(),
            dispatch_wake.clone(),
            config.health_check,
        );

        let dispatcher = Dispatcher::new(
            store.clone(),
            registry.clone(),
            scheduler.clone(),
            upstream.clone(),
            ws_hub.clone(),
            dispatch_wake.clone(),
            config.dispatcher,
        );

        Engine {
            registry,
            store,
            scheduler,
            upstream,
            ws_hub,
            health_prober,
            dispatcher,
            dispatch_wake,
        }
    }

    /// Spawns the health prober and dispatcher loops, returning when both
    /// have observed `shutdown` and exited (spec §5's graceful-shutdown
    /// sequencing: stop accepting new work, let background loops drain).
    pub async fn run_background_tasks(&self, shutdown: CancellationToken) {
        let prober = self.health_prober.clone().run(shutdown.clone());
        let dispatch = self.dispatcher.clone().run(shutdown.clone());
        tokio::join!(prober, dispatch);
    }

    pub async fn register_worker(&self, config: WorkerConfig) -> Worker {
        let worker = self.registry.register(config).await;
        self.dispatch_wake.notify_one();
        worker
    }

    pub async fn submit(
        &self,
        spec: Value,
        client_id: Option<String>,
        extra_data: Option<Value>,
    ) -> Result<Job, GenlbError> {
        let job = self.store.enqueue(spec, client_id, extra_data).await?;
        self.dispatch_wake.notify_one();
        Ok(job)
    }

    pub async fn cancel(&self, job_id: JobId) -> bool {
        self.dispatcher.cancel(job_id).await
    }

    /// Unregisters a worker and fails every job still DISPATCHED/RUNNING on
    /// it, since the worker was its only binding (spec §3: a removed worker
    /// is "destroyed with all dependents"). Returns `false` if no such
    /// worker was registered.
    pub async fn remove_worker(&self, name: &str) -> bool {
        if !self.registry.unregister(name).await {
            return false;
        }
        self.store
            .fail_all_for_worker(name, "backend removed")
            .await;
        self.ws_hub.stop_upstream(name).await;
        self.upstream.remove(name).await;
        true
    }

    /// Runs a probe round immediately rather than waiting for the next
    /// interval tick, for `ControlAPI::POST /lb/health-check`.
    pub async fn trigger_health_check(&self) {
        self.health_prober.check_all().await;
    }

    pub fn set_scheduler_strategy(&self, strategy: Strategy) {
        self.scheduler.set_strategy(strategy);
    }
}
