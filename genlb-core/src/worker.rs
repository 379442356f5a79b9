use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Static configuration for one worker, as supplied by config load or
/// `ControlAPI::register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_queue")]
    pub max_queue: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_weight() -> u32 {
    1
}
fn default_max_queue() -> u32 {
    10
}
fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthClass {
    Unknown,
    Healthy,
    Unhealthy,
}

impl Default for HealthClass {
    fn default() -> Self {
        HealthClass::Unknown
    }
}

/// A registered worker and its live load/health state. Owned exclusively by
/// `WorkerRegistry`; every other component holds at most a cloned snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    pub weight: u32,
    pub max_queue: u32,

    pub health: HealthClass,
    pub running: u32,
    pub pending: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_ok: u32,
    pub consecutive_fail: u32,
}

impl Worker {
    pub fn from_config(config: WorkerConfig) -> Self {
        Worker {
            name: config.name,
            host: config.host,
            port: config.port,
            enabled: config.enabled,
            weight: config.weight.max(1),
            max_queue: config.max_queue.max(1),
            health: HealthClass::Unknown,
            running: 0,
            pending: 0,
            last_probe_at: None,
            consecutive_ok: 0,
            consecutive_fail: 0,
        }
    }

    /// Resolved host+port base URL (spec §3). Built via `url::Url` rather
    /// than raw `format!`, matching the teacher's `Url::parse(&format!(...))`
    /// convention for deriving a base URL from discrete host/port fields.
    pub fn base_url(&self) -> String {
        url::Url::parse(&format!("http://{}:{}", self.host, self.port))
            .expect("host/port always form a valid URL")
            .to_string()
            .trim_end_matches('/')
            .to_string()
    }

    pub fn ws_url(&self) -> String {
        let mut url = url::Url::parse(&self.base_url()).expect("base_url is always valid");
        let _ = url.set_scheme("ws");
        url.set_path("/ws");
        url.to_string()
    }

    pub fn total_load(&self) -> u32 {
        self.running + self.pending
    }

    pub fn is_available(&self) -> bool {
        self.enabled && self.health == HealthClass::Healthy && self.total_load() < self.max_queue
    }

    pub fn is_idle(&self) -> bool {
        self.is_available() && self.total_load() == 0
    }
}

/// Outcome of a single health probe round, as reported by `HealthProber`.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Success { running: u32, pending: u32 },
    Failure,
}
