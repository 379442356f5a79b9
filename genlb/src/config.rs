use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use genlb_core::{Strategy, WorkerConfig};
use serde::{Deserialize, Serialize};

/// Top-level config, shaped exactly as spec'd: `server`, `scheduler`,
/// `healthCheck`, `queue`, `backends`. Every nested struct implements
/// `Default` so a missing config file still yields a usable balancer,
/// mirroring the teacher's `ConfigLoader` fallback behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenlbConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub health_check: HealthCheckConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub backends: Vec<WorkerConfig>,
}

impl Default for GenlbConfig {
    fn default() -> Self {
        GenlbConfig {
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            health_check: HealthCheckConfig::default(),
            queue: QueueConfig::default(),
            backends: Vec::new(),
        }
    }
}

impl GenlbConfig {
    /// A short, non-sensitive multi-line description logged once at
    /// startup. There is no secret material in this config, but the method
    /// is kept for consistency with the teacher's `SafeDisplay` convention,
    /// since `backends[].host`/`port` are exactly the fields worth echoing.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "server: {}:{} (debug={})", self.server.host, self.server.port, self.server.debug);
        let _ = writeln!(
            out,
            "scheduler: strategy={:?} preferIdle={}",
            self.scheduler.strategy, self.scheduler.prefer_idle
        );
        let _ = writeln!(
            out,
            "healthCheck: interval={:?} timeout={:?} healthyThreshold={} unhealthyThreshold={}",
            self.health_check.interval,
            self.health_check.timeout,
            self.health_check.healthy_threshold,
            self.health_check.unhealthy_threshold
        );
        let _ = writeln!(
            out,
            "queue: maxSize={} retryInterval={:?} maxRetries={}",
            self.queue.max_size, self.queue.retry_interval, self.queue.max_retries
        );
        let _ = writeln!(out, "backends:");
        for backend in &self.backends {
            let _ = writeln!(
                out,
                "  {} -> {}:{} (weight={} maxQueue={} enabled={})",
                backend.name, backend.host, backend.port, backend.weight, backend.max_queue, backend.enabled
            );
        }
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8188,
            debug: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub strategy: Strategy,
    pub prefer_idle: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            strategy: Strategy::LeastBusy,
            prefer_idle: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        let core = genlb_core::HealthCheckConfig::default();
        HealthCheckConfig {
            interval: core.interval,
            timeout: core.timeout,
            unhealthy_threshold: core.unhealthy_threshold,
            healthy_threshold: core.healthy_threshold,
        }
    }
}

impl From<HealthCheckConfig> for genlb_core::HealthCheckConfig {
    fn from(value: HealthCheckConfig) -> Self {
        genlb_core::HealthCheckConfig {
            interval: value.interval,
            timeout: value.timeout,
            healthy_threshold: value.healthy_threshold,
            unhealthy_threshold: value.unhealthy_threshold,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_size: usize,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_size: 1000,
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

/// Layers a YAML config file under environment overrides
/// (`GENLB_SERVER__PORT=9000`, etc.), grounded in the teacher's
/// `figment`-based `ConfigLoader` pattern. A missing file is not an error —
/// `Figment::merge` is a no-op for a provider with nothing to contribute,
/// so `GenlbConfig::default()` values survive untouched.
pub fn load(path: Option<&Path>) -> Result<GenlbConfig, figment::Error> {
    let default_path = PathBuf::from("genlb.yaml");
    let path = path.unwrap_or(&default_path);
    Figment::from(figment::providers::Serialized::defaults(GenlbConfig::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed("GENLB_").split("__"))
        .extract()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let config = GenlbConfig::default();
        assert_eq!(config.server.port, 8188);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn loading_without_a_file_falls_back_to_defaults() {
        let config = load(Some(Path::new("/nonexistent/genlb.yaml"))).unwrap();
        assert_eq!(config.queue.max_retries, 3);
    }

    #[test]
    fn describe_mentions_every_backend() {
        let mut config = GenlbConfig::default();
        config.backends.push(WorkerConfig {
            name: "w1".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8188,
            weight: 1,
            max_queue: 10,
            enabled: true,
        });
        assert!(config.describe().contains("w1"));
    }
}
