//! Seam to the cluster resource provisioner.
//!
//! The controller never talks to the orchestrator API directly; every
//! namespace, pod, record, and workload operation goes through the
//! [`ClusterClient`] trait so the reconciliation engine can be exercised
//! against an in-memory cluster in tests.

pub mod api;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by cluster operations.
///
/// `NotFound` is distinguished so callers can map missing objects to
/// "missing resource" responses (or treat them as normal negatives, e.g.
/// an absent usage record meaning `unused`).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("cluster api error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// A container termination observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub exit_code: i32,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Observed runtime facts for one container in a workspace pod.
#[derive(Debug, Clone, Default)]
pub struct ContainerFacts {
    pub name: String,
    pub ready: bool,
    pub restart_count: u32,
    /// Reason string when the container is currently waiting
    /// (e.g. "CrashLoopBackOff", "ImagePullBackOff").
    pub waiting_reason: Option<String>,
    /// Set when the container is currently terminated.
    pub terminated: Option<Termination>,
    /// The most recent prior termination, if any.
    pub last_termination: Option<Termination>,
}

/// Observed runtime facts for a workspace's compute unit.
#[derive(Debug, Clone, Default)]
pub struct PodFacts {
    /// Raw phase string as reported by the cluster ("Running", "Pending", ...).
    pub phase: String,
    /// Pod network address, used for the supervisor probe.
    pub ip: Option<String>,
    pub containers: Vec<ContainerFacts>,
}

/// A namespaced JSON-blob record (config-backed key/value object).
#[derive(Debug, Clone, Default)]
pub struct KvRecord {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub data: HashMap<String, String>,
}

impl KvRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Minimal declaration for the workload object backing one workspace.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub name: String,
    pub replicas: i32,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub cpu: String,
    pub memory: String,
}

/// Cluster resource provisioner interface.
///
/// Implementations: [`api::RestClusterClient`] against a real cluster API,
/// and [`fake::FakeCluster`] (test builds) backed by in-memory maps.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_namespace(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;
    async fn namespace_labels(&self, name: &str) -> Result<HashMap<String, String>>;
    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    /// Names of namespaces carrying every label in `selector`.
    async fn list_namespaces(&self, selector: &HashMap<String, String>) -> Result<Vec<String>>;

    /// Pod facts for pods in `namespace` carrying every label in `selector`.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<PodFacts>>;

    async fn read_record(&self, namespace: &str, name: &str) -> Result<KvRecord>;
    /// Create the record, or replace its data if it already exists.
    async fn write_record(&self, namespace: &str, record: &KvRecord) -> Result<()>;
    async fn delete_record(&self, namespace: &str, name: &str) -> Result<()>;
    async fn list_records(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<KvRecord>>;

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> Result<()>;
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Sanitize a name for use as a cluster object name: lowercase alphanumerics,
/// '-' and '.', must start and end alphanumeric, at most 240 characters
/// (leaving room for prefixes).
pub fn sanitize_name(name: &str) -> String {
    sanitize(name, 240, true)
}

/// Sanitize a value for use as a label: alphanumerics, '-', '_' and '.',
/// must start and end alphanumeric, at most 63 characters.
pub fn sanitize_label(value: &str) -> String {
    sanitize(value, 63, false)
}

fn sanitize(input: &str, max_len: usize, lowercase: bool) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;
    for mut c in input.chars() {
        if lowercase {
            c = c.to_ascii_lowercase();
        }
        let keep = c.is_ascii_alphanumeric() || c == '.' || (!lowercase && c == '_');
        if keep {
            out.push(c);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            // Collapse runs of invalid characters into a single dash.
            out.push('-');
            last_dash = true;
        }
    }
    let mut out: String = out.chars().take(max_len).collect();
    // Names must start and end with an alphanumeric character.
    while out.chars().next().is_some_and(|c| !c.is_ascii_alphanumeric()) {
        out.remove(0);
    }
    while out.chars().last().is_some_and(|c| !c.is_ascii_alphanumeric()) {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("default");
    }
    out
}
