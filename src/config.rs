use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the warmpool controller daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub probe: ProbeConfig,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,
    pub defaults: WorkspaceDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            probe: ProbeConfig::default(),
            monitor: MonitorConfig::default(),
            cache: CacheConfig::default(),
            defaults: WorkspaceDefaults::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.cluster.system_namespace.is_empty(),
            "cluster.system_namespace must not be empty"
        );
        anyhow::ensure!(
            !self.cluster.namespace_prefix.is_empty(),
            "cluster.namespace_prefix must not be empty"
        );
        anyhow::ensure!(self.probe.port != 0, "probe.port must not be 0");
        anyhow::ensure!(
            self.probe.path.starts_with('/'),
            "probe.path must start with '/'"
        );
        anyhow::ensure!(
            self.probe.timeout_secs >= 1,
            "probe.timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.monitor.interval_secs >= 1,
            "monitor.interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.cache.max_entries >= 1,
            "cache.max_entries must be >= 1"
        );
        anyhow::ensure!(
            !self.defaults.image.is_empty(),
            "defaults.image must not be empty"
        );
        Ok(())
    }
}

/// Names and labels used for objects the controller owns on the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Namespace holding controller-level records (pool configs, image cache).
    pub system_namespace: String,
    /// Prefix for per-workspace namespaces (namespace = prefix + workspace id).
    pub namespace_prefix: String,
    /// Label key marking a namespace as pool-owned; the value is the pool label.
    pub pool_label: String,
    /// Label value identifying workspace namespaces and pods.
    pub app_label: String,
    /// Name of the workload object created inside each workspace namespace.
    pub workload_name: String,
    /// Cluster API endpoint. Required for `serve`.
    pub api_url: Option<String>,
    /// Path to a bearer token file for the cluster API.
    pub token_path: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            system_namespace: "workspace-system".into(),
            namespace_prefix: "workspace-".into(),
            pool_label: "pool".into(),
            app_label: "workspace".into(),
            workload_name: "workspace".into(),
            api_url: None,
            token_path: None,
        }
    }
}

/// Settings for the in-workspace process supervisor probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Port the supervisor's status endpoint listens on inside the workspace.
    pub port: u16,
    /// Path of the status endpoint returning the managed process list.
    pub path: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            path: "/jlist".into(),
            timeout_secs: 10,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-pool background monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay before a freshly started monitor runs its first pass, giving
    /// the synchronous initial pass time to settle.
    pub grace_secs: u64,
    /// Interval between periodic reconciliation passes.
    pub interval_secs: u64,
    /// How long pool deletion waits for the monitor task to exit.
    pub stop_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_secs: 10,
            interval_secs: 60,
            stop_timeout_secs: 5,
        }
    }
}

impl MonitorConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Build-artifact cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Retain only this many most-recently-created entries.
    pub max_entries: usize,
    /// Timeout in seconds for resolving a repository's remote head commit.
    pub git_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            git_timeout_secs: 30,
        }
    }
}

impl CacheConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

/// Defaults applied to pools that do not specify their own build settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceDefaults {
    /// Base image used when a pool does not pick one.
    pub image: String,
    /// Default CPU request string.
    pub cpu: String,
    /// Default memory request string.
    pub memory: String,
}

impl Default for WorkspaceDefaults {
    fn default() -> Self {
        Self {
            image: "linuxserver/code-server:latest".into(),
            cpu: "2".into(),
            memory: "8Gi".into(),
        }
    }
}
