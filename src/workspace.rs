//! Workspace views and the usage / recreation-flag records.
//!
//! Usage status and the recreation flag live as JSON blobs in records inside
//! each workspace namespace. Absence of a usage record means `unused`. A
//! recreation flag, once set, is only ever cleared by deleting the
//! workspace; there is deliberately no API to unset it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cluster::{self, sanitize_label, ClusterClient, KvRecord};
use crate::config::ClusterConfig;
use crate::health::{self, HealthState};
use crate::probe::SupervisorProbe;

/// Record name for usage status inside a workspace namespace.
pub const USAGE_RECORD: &str = "workspace-usage";
/// Record name for the recreation flag inside a workspace namespace.
pub const RECREATE_RECORD: &str = "workspace-recreate";

const USAGE_KEY: &str = "usage.json";
const RECREATE_KEY: &str = "recreate.json";

/// Whether a workspace is checked out by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    #[default]
    Unused,
    Used,
}

impl std::fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unused => write!(f, "unused"),
            Self::Used => write!(f, "used"),
        }
    }
}

/// Persisted usage state for one workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageRecord {
    pub status: UsageStatus,
    /// Free-text descriptor of who the workspace was assigned to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marked_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn used(user_info: Option<String>) -> Self {
        Self {
            status: UsageStatus::Used,
            user_info,
            marked_at: Some(Utc::now()),
        }
    }

    pub fn unused() -> Self {
        Self {
            status: UsageStatus::Unused,
            user_info: None,
            marked_at: Some(Utc::now()),
        }
    }
}

/// Persisted recreation flag for one workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecreationFlag {
    pub flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flagged_at: Option<DateTime<Utc>>,
}

/// One observed pool workspace: runtime facts joined with its stored
/// usage state and recreation flag.
#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: String,
    pub namespace: String,
    pub pool: String,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub usage: UsageRecord,
    pub recreation: RecreationFlag,
    /// Passes the strict hand-out predicate.
    pub eligible: bool,
}

impl Workspace {
    pub fn is_unused(&self) -> bool {
        self.usage.status == UsageStatus::Unused
    }
}

/// Reads and writes workspace-scoped state through the cluster provisioner.
pub struct WorkspaceStore {
    cluster: Arc<dyn ClusterClient>,
    probe: Arc<dyn SupervisorProbe>,
    naming: ClusterConfig,
}

impl WorkspaceStore {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        probe: Arc<dyn SupervisorProbe>,
        naming: ClusterConfig,
    ) -> Self {
        Self {
            cluster,
            probe,
            naming,
        }
    }

    pub fn namespace_for(&self, workspace_id: &str) -> String {
        format!("{}{}", self.naming.namespace_prefix, workspace_id)
    }

    fn id_from_namespace(&self, namespace: &str) -> String {
        namespace
            .strip_prefix(&self.naming.namespace_prefix)
            .unwrap_or(namespace)
            .to_string()
    }

    /// Usage record for a workspace. Absence or read failure means unused.
    pub async fn usage(&self, namespace: &str) -> UsageRecord {
        match self.cluster.read_record(namespace, USAGE_RECORD).await {
            Ok(record) => record
                .data
                .get(USAGE_KEY)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            Err(e) => {
                if !e.is_not_found() {
                    warn!(namespace, error = %e, "usage record read failed, treating as unused");
                }
                UsageRecord::default()
            }
        }
    }

    /// Persist a usage record. Unlike reads, failures here surface: marking
    /// a workspace used or releasing it is a caller-visible operation.
    pub async fn set_usage(&self, namespace: &str, usage: &UsageRecord) -> cluster::Result<()> {
        let raw = serde_json::to_string(usage)
            .map_err(|e| cluster::ClusterError::Api(format!("encoding usage record: {}", e)))?;
        let record = KvRecord::new(USAGE_RECORD)
            .with_label("app", "workspace-usage")
            .with_data(USAGE_KEY, raw);
        self.cluster.write_record(namespace, &record).await
    }

    /// Recreation flag for a workspace. Absence or read failure means unflagged.
    pub async fn recreation(&self, namespace: &str) -> RecreationFlag {
        match self.cluster.read_record(namespace, RECREATE_RECORD).await {
            Ok(record) => record
                .data
                .get(RECREATE_KEY)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            Err(e) => {
                if !e.is_not_found() {
                    warn!(namespace, error = %e, "recreation flag read failed, treating as unflagged");
                }
                RecreationFlag::default()
            }
        }
    }

    /// Set the recreation flag. Flagging is idempotent and monotonic: an
    /// already-flagged workspace keeps its original reason and timestamp.
    pub async fn flag_recreation(&self, namespace: &str, reason: &str) -> cluster::Result<()> {
        let existing = self.recreation(namespace).await;
        if existing.flagged {
            return Ok(());
        }
        let flag = RecreationFlag {
            flagged: true,
            reason: Some(reason.to_string()),
            flagged_at: Some(Utc::now()),
        };
        let raw = serde_json::to_string(&flag)
            .map_err(|e| cluster::ClusterError::Api(format!("encoding recreation flag: {}", e)))?;
        let record = KvRecord::new(RECREATE_RECORD)
            .with_label("app", "workspace-recreate")
            .with_data(RECREATE_KEY, raw);
        self.cluster.write_record(namespace, &record).await
    }

    /// Observe one workspace: pod facts, probe, usage, recreation flag.
    pub async fn observe(&self, namespace: &str, pool: &str) -> Workspace {
        let selector: HashMap<String, String> =
            [("app".to_string(), self.naming.app_label.clone())].into();
        let pods = match self.cluster.list_pods(namespace, &selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(namespace, error = %e, "pod listing failed, classifying as creating");
                Vec::new()
            }
        };

        let now = Utc::now();
        let (health, address, eligible) = match pods.first() {
            None => (HealthState::Creating, None, false),
            Some(facts) => {
                // Probe only when the answer can change the outcome.
                let wants_probe = health::needs_probe(facts, now)
                    || health::is_eligible(facts, true, now);
                let probe_ok = match (&facts.ip, wants_probe) {
                    (Some(ip), true) => self.probe.all_online(ip).await,
                    _ => false,
                };
                (
                    health::classify_pod(facts, probe_ok, now),
                    facts.ip.clone(),
                    health::is_eligible(facts, probe_ok, now),
                )
            }
        };

        Workspace {
            id: self.id_from_namespace(namespace),
            namespace: namespace.to_string(),
            pool: pool.to_string(),
            health,
            address,
            usage: self.usage(namespace).await,
            recreation: self.recreation(namespace).await,
            eligible,
        }
    }

    /// Observe every workspace belonging to a pool. Listing failures are
    /// logged and produce an empty result rather than an error.
    pub async fn list_pool(&self, pool_name: &str) -> Vec<Workspace> {
        let selector: HashMap<String, String> = [
            ("app".to_string(), self.naming.app_label.clone()),
            (self.naming.pool_label.clone(), sanitize_label(pool_name)),
        ]
        .into();

        let namespaces = match self.cluster.list_namespaces(&selector).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                warn!(pool = pool_name, error = %e, "pool workspace listing failed");
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            out.push(self.observe(&namespace, pool_name).await);
        }
        out
    }
}
