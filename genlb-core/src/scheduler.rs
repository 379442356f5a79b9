use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::registry::WorkerRegistry;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LeastBusy,
    RoundRobin,
    Weighted,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::LeastBusy
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_busy" => Ok(Strategy::LeastBusy),
            "round_robin" => Ok(Strategy::RoundRobin),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(format!("unknown scheduler strategy: {other}")),
        }
    }
}

/// Stateless-per-call decision function with three pluggable policies
/// (spec §4.3). Only `round_robin`'s cursor is stateful, and it is private
/// to the scheduler, as the spec requires.
pub struct Scheduler {
    strategy: std::sync::Mutex<Strategy>,
    prefer_idle: std::sync::atomic::AtomicBool,
    cursor: AtomicUsize,
}

impl Scheduler {
    pub fn new(strategy: Strategy, prefer_idle: bool) -> Arc<Self> {
        Arc::new(Scheduler {
            strategy: std::sync::Mutex::new(strategy),
            prefer_idle: std::sync::atomic::AtomicBool::new(prefer_idle),
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.lock().unwrap()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.lock().unwrap() = strategy;
        tracing::info!(?strategy, "scheduler strategy changed");
    }

    pub fn prefer_idle(&self) -> bool {
        self.prefer_idle.load(Ordering::Relaxed)
    }

    /// Two-pass selection (spec §4.3): if `preferIdle`, try idle workers
    /// first; fall back to any available worker; `None` means "park".
    pub async fn select(&self, registry: &WorkerRegistry) -> Option<Worker> {
        if self.prefer_idle() {
            let idle = registry.idle().await;
            if let Some(worker) = self.pick(&idle) {
                return Some(worker);
            }
        }
        let available = registry.available().await;
        self.pick(&available)
    }

    fn pick(&self, candidates: &[Worker]) -> Option<Worker> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy() {
            Strategy::LeastBusy => candidates
                .iter()
                .min_by_key(|w| w.total_load())
                .cloned(),
            Strategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[idx].clone())
            }
            Strategy::Weighted => candidates
                .iter()
                .max_by(|a, b| score(a).partial_cmp(&score(b)).unwrap())
                .cloned(),
        }
    }
}

fn score(worker: &Worker) -> f64 {
    worker.weight as f64 / (1.0 + worker.total_load() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerConfig;

    async fn registry_with(workers: Vec<(&str, u32, u32)>) -> Arc<WorkerRegistry> {
        let registry = WorkerRegistry::new();
        for (name, weight, max_queue) in workers {
            registry
                .register(WorkerConfig {
                    name: name.to_string(),
                    host: "127.0.0.1".into(),
                    port: 8188,
                    weight,
                    max_queue,
                    enabled: true,
                })
                .await;
            registry
                .update_health(
                    name,
                    crate::worker::ProbeOutcome::Success {
                        running: 0,
                        pending: 0,
                    },
                    1,
                    3,
                )
                .await;
        }
        registry
    }

    #[tokio::test]
    async fn least_busy_picks_minimum_load() {
        let registry = registry_with(vec![("a", 1, 10), ("b", 1, 10)]).await;
        registry
            .update_health(
                "a",
                crate::worker::ProbeOutcome::Success {
                    running: 3,
                    pending: 0,
                },
                1,
                3,
            )
            .await;
        let scheduler = Scheduler::new(Strategy::LeastBusy, false);
        let chosen = scheduler.select(&registry).await.unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let registry = registry_with(vec![("a", 1, 10), ("b", 1, 10)]).await;
        let scheduler = Scheduler::new(Strategy::RoundRobin, false);
        let first = scheduler.select(&registry).await.unwrap();
        let second = scheduler.select(&registry).await.unwrap();
        assert_ne!(first.name, second.name);
    }

    #[tokio::test]
    async fn prefer_idle_falls_back_to_available() {
        let registry = registry_with(vec![("a", 1, 10)]).await;
        registry
            .update_health(
                "a",
                crate::worker::ProbeOutcome::Success {
                    running: 1,
                    pending: 0,
                },
                1,
                3,
            )
            .await;
        let scheduler = Scheduler::new(Strategy::LeastBusy, true);
        let chosen = scheduler.select(&registry).await.unwrap();
        assert_eq!(chosen.name, "a");
    }

    #[tokio::test]
    async fn no_workers_parks() {
        let registry = WorkerRegistry::new();
        let scheduler = Scheduler::new(Strategy::LeastBusy, true);
        assert!(scheduler.select(&registry).await.is_none());
    }
}
