use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::WorkerRegistry;
use crate::upstream::UpstreamClients;
use crate::worker::ProbeOutcome;
use crate::ws_hub::WsHub;

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            healthy_threshold: 1,
            unhealthy_threshold: 3,
        }
    }
}

/// Periodically refreshes each worker's queue depth and health class
/// (spec §4.2). Every tick concurrently probes every worker.
pub struct HealthProber {
    registry: Arc<WorkerRegistry>,
    upstream: Arc<UpstreamClients>,
    ws_hub: Arc<WsHub>,
    dispatch_wake: Arc<Notify>,
    config: HealthCheckConfig,
}

impl HealthProber {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        upstream: Arc<UpstreamClients>,
        ws_hub: Arc<WsHub>,
        dispatch_wake: Arc<Notify>,
        config: HealthCheckConfig,
    ) -> Arc<Self> {
        Arc::new(HealthProber {
            registry,
            upstream,
            ws_hub,
            dispatch_wake,
            config,
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("health prober stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.check_all().await;
                }
            }
        }
    }

    /// Runs one probe round immediately, outside the regular interval
    /// (used at startup and by `ControlAPI::POST /lb/health-check`).
    pub async fn check_all(&self) {
        let workers = self.registry.all().await;
        if workers.is_empty() {
            return;
        }

        let outcomes = futures_util::future::join_all(
            workers.iter().map(|w| self.probe_one(w.name.clone())),
        )
        .await;

        let mut any_change = false;
        for (worker, became_healthy) in workers.iter().zip(outcomes) {
            if let Some(is_healthy) = became_healthy {
                any_change = true;
                if is_healthy {
                    self.dispatch_wake.notify_one();
                }
            }
            let _ = worker;
        }

        if any_change {
            self.broadcast_backend_update().await;
        }
    }

    async fn probe_one(&self, worker_name: String) -> Option<bool> {
        let worker = self.registry.get(&worker_name).await?;
        let client = self.upstream.get(&worker).await;
        let outcome = match client.get_queue().await {
            Ok(snapshot) => ProbeOutcome::Success {
                running: snapshot.running,
                pending: snapshot.pending,
            },
            Err(e) => {
                debug!(worker = %worker_name, error = %e, "probe failed");
                ProbeOutcome::Failure
            }
        };

        let changed = self
            .registry
            .update_health(
                &worker_name,
                outcome,
                self.config.healthy_threshold,
                self.config.unhealthy_threshold,
            )
            .await;

        if changed == Some(true) {
            self.ws_hub.start_upstream(&worker_name).await;
        } else if changed == Some(false) {
            warn!(worker = %worker_name, "worker marked unhealthy");
        }
        changed
    }

    async fn broadcast_backend_update(&self) {
        let workers = self.registry.all().await;
        let total = workers.len();
        let healthy = workers
            .iter()
            .filter(|w| w.enabled && w.health == crate::worker::HealthClass::Healthy)
            .count();
        let idle = workers.iter().filter(|w| w.is_idle()).count();

        self.ws_hub
            .broadcast(serde_json::json!({
                "type": "backend_update",
                "data": {},
            }))
            .await;
        self.ws_hub
            .broadcast(serde_json::json!({
                "type": "stats_update",
                "data": {
                    "total_backends": total,
                    "healthy_backends": healthy,
                    "idle_backends": idle,
                }
            }))
            .await;
    }
}
