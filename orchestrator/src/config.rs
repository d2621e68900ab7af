//! Configuration for the orchestrator.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Identity of this orchestrator instance.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InstanceConfig {
    /// Fixed instance id. A random UUID is generated when unset, which is
    /// what replicated deployments normally want.
    #[serde(default)]
    pub id: Option<String>,
}

impl InstanceConfig {
    pub fn resolve_id(&self) -> String {
        self.id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Worker process management.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory containing model files. Model keys are file names inside it.
    pub model_dir: String,
    /// Path to the worker server binary or a wrapper command.
    pub worker_binary: String,
    /// Extra arguments inserted BEFORE the model args (wrapper commands).
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// Extra arguments appended AFTER the standard worker flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Context window size (--ctx_size flag).
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// First port handed to workers.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Last port handed to workers (inclusive).
    #[serde(default = "default_max_port")]
    pub max_port: u16,
    /// Inactivity before a worker is evicted.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// Records idle for `stale_multiplier * ttl` are evicted whoever owns them.
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: u32,
    /// Garbage collection period.
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    /// Grace period between SIGTERM and a forced kill.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Host the workers listen on.
    #[serde(default = "default_worker_host")]
    pub worker_host: String,
    /// Health probe timeout.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// File extensions listed as models (case-insensitive).
    #[serde(default = "default_model_extensions")]
    pub model_extensions: Vec<String>,
    /// Inherit worker stdout/stderr instead of discarding them.
    #[serde(default)]
    pub log_worker_output: bool,
}

impl OrchestratorConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_after(&self) -> Duration {
        self.ttl() * self.stale_multiplier.max(1)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Durable registry location.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// SQLite database path (`sqlite:` prefix accepted).
    #[serde(default = "default_registry_path")]
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Timeout of a single `/next-token` pull.
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
    /// How long refused connections to a starting worker are retried.
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,
    /// Pause between those retries.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

impl RelayConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pull_timeout_secs: default_pull_timeout(),
            startup_grace_secs: default_startup_grace(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_context_size() -> u32 {
    2048
}
fn default_base_port() -> u16 {
    4000
}
fn default_max_port() -> u16 {
    4999
}
fn default_ttl() -> u64 {
    60
}
fn default_stale_multiplier() -> u32 {
    2
}
fn default_gc_interval() -> u64 {
    5
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_worker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_probe_timeout() -> u64 {
    1000
}
fn default_model_extensions() -> Vec<String> {
    vec!["bin".to_string(), "gguf".to_string()]
}
fn default_registry_path() -> String {
    "./data/registry.db".to_string()
}
fn default_pull_timeout() -> u64 {
    30
}
fn default_startup_grace() -> u64 {
    60
}
fn default_retry_interval() -> u64 {
    250
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (FLEET__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .set_default("registry.path", default_registry_path())?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("FLEET")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("orchestrator.worker_args")
                    .with_list_parse_key("orchestrator.extra_args")
                    .with_list_parse_key("orchestrator.model_extensions")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
