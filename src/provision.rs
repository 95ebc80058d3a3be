//! Workspace provisioning interface.
//!
//! The reconciler only knows how to ask for "a running workspace built from
//! this configuration" and how to tear one down by id. The default
//! implementation maps those calls onto the cluster provisioner: one
//! namespace per workspace plus a single-replica workload inside it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterClient, WorkloadSpec};
use crate::config::ClusterConfig;

/// One source repository checked out into the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSource {
    pub url: String,
    pub branch: String,
}

/// An environment variable injected into the workspace container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Optional build/container override files supplied by the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOverrides {
    /// Base Dockerfile content.
    pub dockerfile: Option<String>,
    /// Compose file content.
    pub compose_file: Option<String>,
    /// Process-manager (supervisor) config content.
    pub supervisor_config: Option<String>,
}

impl BuildOverrides {
    /// Non-empty override files as (label, content) pairs.
    pub fn present(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        for (label, value) in [
            ("dockerfile", &self.dockerfile),
            ("compose_file", &self.compose_file),
            ("supervisor_config", &self.supervisor_config),
        ] {
            if let Some(content) = value {
                if !content.trim().is_empty() {
                    out.push((label, content.as_str()));
                }
            }
        }
        out
    }
}

/// How the workspace container image is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSpec {
    /// A prebuilt image used as-is.
    Direct { url: String },
    /// A catalog base image, optionally built through a dev-container
    /// definition found in the repository.
    Base { image: String, dev_container: bool },
}

/// Everything needed to provision one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    pub repos: Vec<RepoSource>,
    pub credential_ref: Option<String>,
    pub env: Vec<EnvVar>,
    pub overrides: BuildOverrides,
    pub image: ImageSpec,
    pub cpu: String,
    pub memory: String,
}

impl WorkspaceSpec {
    /// Image reference the workload runs with.
    pub fn image_reference(&self) -> &str {
        match &self.image {
            ImageSpec::Direct { url } => url,
            ImageSpec::Base { image, .. } => image,
        }
    }
}

/// Creates fully running workspaces and deletes them by id.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Provision a workspace and return its opaque id.
    async fn create(&self, spec: &WorkspaceSpec) -> Result<String>;
    /// Tear down a workspace by id.
    async fn delete(&self, workspace_id: &str) -> Result<()>;
}

/// Default provisioner: one labeled namespace per workspace containing a
/// single-replica workload.
pub struct ClusterWorkspaceProvisioner {
    cluster: Arc<dyn ClusterClient>,
    naming: ClusterConfig,
}

impl ClusterWorkspaceProvisioner {
    pub fn new(cluster: Arc<dyn ClusterClient>, naming: ClusterConfig) -> Self {
        Self { cluster, naming }
    }

    fn workload_for(&self, spec: &WorkspaceSpec) -> WorkloadSpec {
        let mut env: Vec<(String, String)> = Vec::new();
        for (i, repo) in spec.repos.iter().enumerate() {
            let suffix = if i == 0 { String::new() } else { format!("_{}", i) };
            env.push((format!("GIT_URL{}", suffix), repo.url.clone()));
            env.push((format!("GIT_BRANCH{}", suffix), repo.branch.clone()));
        }
        if let Some(cred) = &spec.credential_ref {
            env.push(("GIT_CREDENTIAL_REF".to_string(), cred.clone()));
        }
        for var in &spec.env {
            env.push((var.name.clone(), var.value.clone()));
        }

        let mut labels = HashMap::new();
        labels.insert("app".to_string(), self.naming.app_label.clone());

        WorkloadSpec {
            name: self.naming.workload_name.clone(),
            replicas: 1,
            image: spec.image_reference().to_string(),
            env,
            labels,
            cpu: spec.cpu.clone(),
            memory: spec.memory.clone(),
        }
    }
}

#[async_trait]
impl WorkspaceProvisioner for ClusterWorkspaceProvisioner {
    async fn create(&self, spec: &WorkspaceSpec) -> Result<String> {
        let workspace_id = Uuid::new_v4().to_string();
        let namespace = format!("{}{}", self.naming.namespace_prefix, workspace_id);

        let mut labels = HashMap::new();
        labels.insert("app".to_string(), self.naming.app_label.clone());
        labels.insert("workspace-id".to_string(), workspace_id.clone());

        self.cluster
            .create_namespace(&namespace, &labels)
            .await
            .with_context(|| format!("creating namespace {}", namespace))?;

        if let Err(e) = self
            .cluster
            .create_workload(&namespace, &self.workload_for(spec))
            .await
        {
            // Roll the half-created workspace back so the failure leaves
            // nothing behind.
            warn!(namespace = %namespace, error = %e, "workload creation failed, rolling back namespace");
            if let Err(del) = self.cluster.delete_namespace(&namespace).await {
                warn!(namespace = %namespace, error = %del, "rollback delete failed");
            }
            return Err(e).with_context(|| format!("creating workload in {}", namespace));
        }

        info!(workspace_id = %workspace_id, image = spec.image_reference(), "workspace provisioned");
        Ok(workspace_id)
    }

    async fn delete(&self, workspace_id: &str) -> Result<()> {
        let namespace = format!("{}{}", self.naming.namespace_prefix, workspace_id);
        self.cluster
            .delete_namespace(&namespace)
            .await
            .with_context(|| format!("deleting namespace {}", namespace))?;
        info!(workspace_id = %workspace_id, "workspace deleted");
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Scriptable provisioner for tests: records created/deleted ids and can
    /// fail specific create calls (1-based call numbers).
    #[derive(Default)]
    pub struct FakeProvisioner {
        calls: AtomicUsize,
        pub fail_calls: Vec<usize>,
        pub created: Mutex<Vec<String>>,
        pub deleted: Mutex<Vec<String>>,
        /// Optional cluster to mirror namespace creation into, so that
        /// pool listing sees the new members.
        pub mirror: Option<MirrorTarget>,
    }

    pub struct MirrorTarget {
        pub cluster: Arc<crate::cluster::fake::FakeCluster>,
        pub naming: ClusterConfig,
    }

    impl FakeProvisioner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn mirroring(
            cluster: Arc<crate::cluster::fake::FakeCluster>,
            naming: ClusterConfig,
        ) -> Self {
            Self {
                mirror: Some(MirrorTarget { cluster, naming }),
                ..Self::default()
            }
        }

        pub async fn created_count(&self) -> usize {
            self.created.lock().await.len()
        }

        pub async fn deleted_ids(&self) -> Vec<String> {
            self.deleted.lock().await.clone()
        }
    }

    #[async_trait]
    impl WorkspaceProvisioner for FakeProvisioner {
        async fn create(&self, _spec: &WorkspaceSpec) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_calls.contains(&call) {
                anyhow::bail!("injected create failure on call {}", call);
            }
            let id = Uuid::new_v4().to_string();
            if let Some(mirror) = &self.mirror {
                let namespace = format!("{}{}", mirror.naming.namespace_prefix, id);
                let mut labels = HashMap::new();
                labels.insert("app".to_string(), mirror.naming.app_label.clone());
                labels.insert("workspace-id".to_string(), id.clone());
                mirror
                    .cluster
                    .create_namespace(&namespace, &labels)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            }
            self.created.lock().await.push(id.clone());
            Ok(id)
        }

        async fn delete(&self, workspace_id: &str) -> Result<()> {
            if let Some(mirror) = &self.mirror {
                let namespace =
                    format!("{}{}", mirror.naming.namespace_prefix, workspace_id);
                mirror
                    .cluster
                    .delete_namespace(&namespace)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            }
            self.deleted.lock().await.push(workspace_id.to_string());
            Ok(())
        }
    }
}
