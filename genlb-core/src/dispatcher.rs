use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::JobId;
use crate::job_store::JobStore;
use crate::registry::WorkerRegistry;
use crate::scheduler::Scheduler;
use crate::upstream::UpstreamClients;
use crate::ws_hub::WsHub;

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Single-consumer, event-driven dispatch loop (spec §4.4). Wakes on a
/// new-job enqueue, a worker's health-class transition to HEALTHY, or a
/// periodic liveness tick, and on each wake drains every pending job it can
/// place before parking again.
pub struct Dispatcher {
    store: Arc<JobStore>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    upstream: Arc<UpstreamClients>,
    ws_hub: Arc<WsHub>,
    wake: Arc<Notify>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<Scheduler>,
        upstream: Arc<UpstreamClients>,
        ws_hub: Arc<WsHub>,
        wake: Arc<Notify>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            store,
            registry,
            scheduler,
            upstream,
            ws_hub,
            wake,
            config,
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("dispatcher stopping");
                    break;
                }
                _ = self.wake.notified() => {
                    self.drain().await;
                }
                _ = tokio::time::sleep(self.config.retry_interval) => {
                    self.drain().await;
                }
            }
        }
    }

    /// Drains as many pending jobs as the scheduler can currently place.
    /// Stops as soon as `select` parks (returns `None`) rather than on the
    /// first failure — a failed dispatch is "handled" by the retry rule and
    /// must not stall jobs behind it (spec §4.4).
    pub async fn drain(&self) {
        loop {
            let Some(job) = self.store.peek_oldest_pending().await else {
                break;
            };
            let Some(worker) = self.scheduler.select(&self.registry).await else {
                break;
            };

            let dispatched = match self
                .store
                .move_pending_to_dispatched(job.id, &worker.name)
                .await
            {
                Ok(job) => job,
                Err(_) => continue, // raced with cancellation; retry the loop on the next job
            };

            self.registry.optimistic_increment_pending(&worker.name).await;

            let client = self.upstream.get(&worker).await;
            let sid = bridge_session_id(&worker.name);
            match client.submit(&dispatched.spec, &sid).await {
                Ok(outcome) => {
                    if let Err(e) = self
                        .store
                        .bind_worker_job_id(dispatched.id, outcome.worker_job_id.clone())
                        .await
                    {
                        warn!(job_id = %dispatched.id, error = %e, "failed to bind worker job id");
                    } else {
                        info!(
                            job_id = %dispatched.id,
                            worker = %worker.name,
                            worker_job_id = %outcome.worker_job_id,
                            "job dispatched"
                        );
                    }
                }
                Err(e) => {
                    warn!(job_id = %dispatched.id, worker = %worker.name, error = %e, "dispatch attempt failed");
                    match self
                        .store
                        .mark_attempt_failed(dispatched.id, e.to_string(), self.config.max_retries)
                        .await
                    {
                        Ok(status) => {
                            debug!(job_id = %dispatched.id, ?status, "dispatch failure handled");
                        }
                        Err(e) => {
                            warn!(job_id = %dispatched.id, error = %e, "could not record dispatch failure");
                        }
                    }
                }
            }
        }
    }

    /// Cancels a job by id, issuing the upstream cancel call when the job
    /// had already been bound to a worker (spec §4.4). Returns `true` if the
    /// job existed in a cancellable (non-terminal) state.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        use crate::job::CancelOutcome;
        match self.store.cancel(job_id).await {
            CancelOutcome::RemovedFromQueue => true,
            CancelOutcome::CancelUpstream(binding) => {
                if let Some((worker_name, worker_job_id)) = binding {
                    if let Some(worker) = self.registry.get(&worker_name).await {
                        let client = self.upstream.get(&worker).await;
                        if let Err(e) = client.cancel(&worker_job_id).await {
                            warn!(%worker_name, %worker_job_id, error = %e, "upstream cancel failed, local state already CANCELLED");
                        }
                    }
                }
                true
            }
            CancelOutcome::AlreadyTerminal => true,
            CancelOutcome::NotFound => false,
        }
    }
}

pub fn bridge_session_id(worker_name: &str) -> String {
    WsHub::bridge_session_id(worker_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Strategy;
    use crate::worker::WorkerConfig;
    use serde_json::json;

    fn build() -> (
        Arc<JobStore>,
        Arc<WorkerRegistry>,
        Arc<Scheduler>,
        Arc<UpstreamClients>,
        Arc<WsHub>,
        Arc<Notify>,
    ) {
        let store = JobStore::new(100);
        let registry = WorkerRegistry::new();
        let scheduler = Scheduler::new(Strategy::LeastBusy, false);
        let upstream = Arc::new(UpstreamClients::new(Duration::from_secs(1)));
        let ws_hub = WsHub::new(registry.clone(), store.clone(), Duration::from_secs(2));
        let wake = Arc::new(Notify::new());
        (store, registry, scheduler, upstream, ws_hub, wake)
    }

    #[tokio::test]
    async fn drain_parks_with_no_healthy_workers() {
        let (store, registry, scheduler, upstream, ws_hub, wake) = build();
        let dispatcher = Dispatcher::new(store.clone(), registry, scheduler, upstream, ws_hub, wake, DispatcherConfig::default());
        store.enqueue(json!({}), None, None).await.unwrap();
        dispatcher.drain().await;
        let status = store.status().await;
        assert_eq!(status.pending, 1);
        assert_eq!(status.dispatched, 0);
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        let (store, registry, scheduler, upstream, ws_hub, wake) = build();
        let dispatcher = Dispatcher::new(store, registry, scheduler, upstream, ws_hub, wake, DispatcherConfig::default());
        assert!(!dispatcher.cancel(uuid::Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn cancel_pending_job_succeeds_without_upstream_call() {
        let (store, registry, scheduler, upstream, ws_hub, wake) = build();
        let job = store.enqueue(json!({}), None, None).await.unwrap();
        let dispatcher = Dispatcher::new(store, registry, scheduler, upstream, ws_hub, wake, DispatcherConfig::default());
        assert!(dispatcher.cancel(job.id).await);
    }

    #[tokio::test]
    async fn registering_worker_with_no_health_keeps_drain_parked() {
        let (store, registry, scheduler, upstream, ws_hub, wake) = build();
        registry
            .register(WorkerConfig {
                name: "w1".into(),
                host: "127.0.0.1".into(),
                port: 8188,
                weight: 1,
                max_queue: 10,
                enabled: true,
            })
            .await;
        let dispatcher = Dispatcher::new(store.clone(), registry, scheduler, upstream, ws_hub, wake, DispatcherConfig::default());
        store.enqueue(json!({}), None, None).await.unwrap();
        dispatcher.drain().await;
        assert_eq!(store.status().await.pending, 1);
    }
}
