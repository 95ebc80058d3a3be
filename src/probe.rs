//! Supervisor liveness probe.
//!
//! Every workspace runs a process supervisor exposing its managed process
//! list over HTTP. A workspace only counts as fully running once that
//! endpoint answers and reports every process `online`; anything else
//! (timeout, connection refused, non-200, malformed body) is a plain
//! negative, never an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::ProbeConfig;

/// One entry in the supervisor's process list.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagedProcess {
    pub name: String,
    pub status: String,
}

/// Probe interface, so health classification is testable without a network.
#[async_trait]
pub trait SupervisorProbe: Send + Sync {
    /// True only when the workspace at `addr` answers and reports all of its
    /// managed processes online.
    async fn all_online(&self, addr: &str) -> bool;
}

/// HTTP probe against the supervisor status endpoint.
pub struct ProcessProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl ProcessProbe {
    pub fn new(cfg: &ProbeConfig) -> anyhow::Result<Self> {
        // The timeout is baked into the client so every request is bounded.
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .connect_timeout(Duration::from_secs(cfg.timeout_secs.min(5)))
            .build()?;
        Ok(Self {
            client,
            port: cfg.port,
            path: cfg.path.clone(),
        })
    }
}

#[async_trait]
impl SupervisorProbe for ProcessProbe {
    async fn all_online(&self, addr: &str) -> bool {
        let url = format!("http://{}:{}{}", addr, self.port, self.path);
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                trace!(url = %url, error = %e, "supervisor probe request failed");
                return false;
            }
        };
        if !resp.status().is_success() {
            trace!(url = %url, status = %resp.status(), "supervisor probe non-success");
            return false;
        }
        match resp.json::<Vec<ManagedProcess>>().await {
            Ok(processes) => {
                let ok = all_processes_online(&processes);
                debug!(url = %url, processes = processes.len(), ok, "supervisor probe");
                ok
            }
            Err(e) => {
                trace!(url = %url, error = %e, "supervisor probe body malformed");
                false
            }
        }
    }
}

/// True when every managed process reports `online`. An empty list is
/// positive: the supervisor is up and has nothing left to start.
pub fn all_processes_online(processes: &[ManagedProcess]) -> bool {
    processes.iter().all(|p| p.status == "online")
}
