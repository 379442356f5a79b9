use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::GenlbError;
use crate::worker::{HealthClass, ProbeOutcome, Worker, WorkerConfig};

/// Owns the set of worker records and their mutable load/health state
/// (spec §4.1). The whole map is guarded by a single mutex: every mutation
/// is a short, non-nested critical section, and read methods return owned
/// snapshots so callers never hold the lock while doing further work.
///
/// Backed by `IndexMap` rather than `HashMap` so iteration follows
/// registration order — `Scheduler`'s `least_busy`/`weighted` tie-breaks
/// depend on that stable order (spec.md §4.3), matching the insertion-order
/// `dict` the original `backend_manager.py` keeps its backends in.
pub struct WorkerRegistry {
    workers: Mutex<IndexMap<String, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerRegistry {
            workers: Mutex::new(IndexMap::new()),
        })
    }

    pub async fn register(&self, config: WorkerConfig) -> Worker {
        let worker = Worker::from_config(config);
        let mut guard = self.workers.lock().await;
        info!(name = %worker.name, base_url = %worker.base_url(), "registered worker");
        guard.insert(worker.name.clone(), worker.clone());
        worker
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut guard = self.workers.lock().await;
        let removed = guard.shift_remove(name).is_some();
        if removed {
            info!(%name, "unregistered worker");
        }
        removed
    }

    pub async fn get(&self, name: &str) -> Option<Worker> {
        self.workers.lock().await.get(name).cloned()
    }

    pub async fn all(&self) -> Vec<Worker> {
        self.workers.lock().await.values().cloned().collect()
    }

    pub async fn available(&self) -> Vec<Worker> {
        self.workers
            .lock()
            .await
            .values()
            .filter(|w| w.is_available())
            .cloned()
            .collect()
    }

    pub async fn idle(&self) -> Vec<Worker> {
        self.workers
            .lock()
            .await
            .values()
            .filter(|w| w.is_idle())
            .cloned()
            .collect()
    }

    pub async fn healthy(&self) -> Vec<Worker> {
        self.workers
            .lock()
            .await
            .values()
            .filter(|w| w.enabled && w.health == HealthClass::Healthy)
            .cloned()
            .collect()
    }

    pub async fn enable(&self, name: &str) -> Result<(), GenlbError> {
        let mut guard = self.workers.lock().await;
        let worker = guard
            .get_mut(name)
            .ok_or_else(|| GenlbError::NotFound(format!("worker {name}")))?;
        worker.enabled = true;
        info!(%name, "enabled worker");
        Ok(())
    }

    pub async fn disable(&self, name: &str) -> Result<(), GenlbError> {
        let mut guard = self.workers.lock().await;
        let worker = guard
            .get_mut(name)
            .ok_or_else(|| GenlbError::NotFound(format!("worker {name}")))?;
        worker.enabled = false;
        info!(%name, "disabled worker");
        Ok(())
    }

    /// Applied by the dispatcher immediately after a successful submit, so
    /// subsequent scheduling decisions in the same drain see the updated
    /// load before the next probe snapshot arrives (spec §4.1).
    pub async fn optimistic_increment_pending(&self, name: &str) {
        let mut guard = self.workers.lock().await;
        if let Some(worker) = guard.get_mut(name) {
            worker.pending += 1;
        }
    }

    /// Applied by the health prober. A probe snapshot *replaces* the load
    /// counters outright, which is why the dispatcher's optimistic
    /// increment above is only ever transient (spec §4.1).
    ///
    /// Returns `Some(is_healthy)` when this probe caused a health-class
    /// transition, so the caller can decide whether to wake the dispatcher
    /// and/or broadcast a `backend_update` event.
    pub async fn update_health(
        &self,
        name: &str,
        outcome: ProbeOutcome,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Option<bool> {
        let mut guard = self.workers.lock().await;
        let worker = guard.get_mut(name)?;
        let previous = worker.health;
        worker.last_probe_at = Some(chrono::Utc::now());

        match outcome {
            ProbeOutcome::Success { running, pending } => {
                worker.running = running;
                worker.pending = pending;
                worker.consecutive_ok += 1;
                worker.consecutive_fail = 0;
                if worker.consecutive_ok >= healthy_threshold {
                    worker.health = HealthClass::Healthy;
                }
            }
            ProbeOutcome::Failure => {
                worker.consecutive_fail += 1;
                worker.consecutive_ok = 0;
                if worker.consecutive_fail >= unhealthy_threshold {
                    worker.health = HealthClass::Unhealthy;
                }
            }
        }

        if previous == worker.health {
            debug!(%name, health = ?worker.health, "probe: no health-class change");
            return None;
        }

        match worker.health {
            HealthClass::Healthy => info!(%name, "worker recovered: now healthy"),
            HealthClass::Unhealthy => warn!(%name, "worker degraded: now unhealthy"),
            HealthClass::Unknown => {}
        }
        Some(worker.health == HealthClass::Healthy)
    }
}
