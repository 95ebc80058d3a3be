//! Pool registry and reconciliation engine.
//!
//! `PoolManager` is the single owned registry of pool state: settings,
//! per-pool scaling locks, and monitor tasks. It is handed by reference to
//! the API layer rather than living as ambient module state, and is
//! rebuilt from persisted records at process start via [`PoolManager::hydrate`].
//!
//! # Locking discipline
//!
//! Registry maps (`pools`, `scaling_locks`) are behind short-lived RwLocks
//! that are never held across an await on cluster I/O. The per-pool scaling
//! mutex exists for exactly one reason: two reconciliation passes computing
//! `needed` against the same stale snapshot would over-provision. Background
//! ticks take it with `try_lock` and skip on contention; caller-visible
//! operations (create, scale, update) block on it. Usage-status reads and
//! the select-available scan take no lock at all, see
//! [`PoolManager::get_available_workspace`].

pub mod monitor;
pub mod reconcile;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cluster::{sanitize_label, sanitize_name, ClusterClient, ClusterError, KvRecord};
use crate::config::Config;
use crate::health::HealthState;
use crate::probe::SupervisorProbe;
use crate::provision::{
    BuildOverrides, EnvVar, ImageSpec, RepoSource, WorkspaceProvisioner, WorkspaceSpec,
};
use crate::workspace::{UsageRecord, Workspace, WorkspaceStore};

use monitor::MonitorHandle;
use reconcile::{ReconcileOutcome, ReconcilePlan, StateCounts};

/// Data key inside a pool's persisted record.
pub const POOL_RECORD_KEY: &str = "pool.json";
/// Label identifying pool records in the system namespace.
pub const POOL_RECORD_LABEL: &str = "workspace-pool";

const POOL_SCHEMA_VERSION: u32 = 1;

/// Errors surfaced to the API layer.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Validation(String),

    #[error("pool '{0}' not found")]
    NotFound(String),

    #[error("workspace '{0}' not found")]
    WorkspaceNotFound(String),

    #[error("workspace '{workspace}' does not belong to pool '{pool}'")]
    NotAMember { workspace: String, pool: String },

    #[error("caller '{0}' may not act on this pool")]
    Forbidden(String),

    #[error("workspace '{0}' is not ready to be handed out")]
    NotReady(String),

    #[error("failed to persist pool state")]
    Persistence(#[source] ClusterError),

    #[error("workspace provisioning failed: {0:#}")]
    Provision(anyhow::Error),
}

/// Caller identity for ownership checks. Administrators may act on any
/// pool; everyone else only on pools they own.
#[derive(Debug, Clone)]
pub struct Caller {
    pub principal: String,
    pub admin: bool,
}

impl Caller {
    pub fn user(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            admin: false,
        }
    }

    pub fn admin(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            admin: true,
        }
    }
}

fn default_cpu() -> String {
    "2".into()
}

fn default_memory() -> String {
    "8Gi".into()
}

/// Persisted pool configuration. Loaded records from older controller
/// versions get their missing fields defaulted here, once, rather than at
/// every use site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default)]
    pub schema_version: u32,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub minimum: u32,
    pub repos: Vec<RepoSource>,
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub overrides: BuildOverrides,
    /// Image selection; `None` falls back to the controller default.
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    pub created_at: DateTime<Utc>,
    pub owner: String,
}

/// Caller-supplied configuration for a new pool.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub name: String,
    pub minimum: u32,
    pub repos: Vec<RepoSource>,
    pub credential_ref: Option<String>,
    pub env: Vec<EnvVar>,
    pub overrides: BuildOverrides,
    pub image: Option<ImageSpec>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub display_name: Option<String>,
}

/// Partial pool update; `None` leaves a field unchanged. Every field except
/// `display_name` is build-affecting: changing one invalidates the images
/// of existing members.
#[derive(Debug, Clone, Default)]
pub struct PoolUpdate {
    pub display_name: Option<String>,
    pub repos: Option<Vec<RepoSource>>,
    pub credential_ref: Option<String>,
    pub env: Option<Vec<EnvVar>>,
    pub overrides: Option<BuildOverrides>,
    pub image: Option<ImageSpec>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Point-in-time view of a pool for the API layer.
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub minimum: u32,
    pub total: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
    pub used: usize,
    pub unused: usize,
    pub workspaces: Vec<Workspace>,
}

/// What happened to a workspace on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Returned to the pool as unused.
    Released,
    /// The recreation flag was set, so the release became a deletion.
    Deleted,
}

pub struct PoolManager {
    cfg: Config,
    cluster: Arc<dyn ClusterClient>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    store: WorkspaceStore,
    pools: RwLock<HashMap<String, PoolSettings>>,
    scaling_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    /// Self-reference handed to monitor tasks so they never keep the
    /// manager alive on their own.
    weak: Weak<PoolManager>,
}

impl PoolManager {
    pub fn new(
        cfg: Config,
        cluster: Arc<dyn ClusterClient>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        probe: Arc<dyn SupervisorProbe>,
    ) -> Arc<Self> {
        let store = WorkspaceStore::new(cluster.clone(), probe, cfg.cluster.clone());
        Arc::new_cyclic(|weak| Self {
            cfg,
            cluster,
            provisioner,
            store,
            pools: RwLock::new(HashMap::new()),
            scaling_locks: RwLock::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Reload every persisted pool record and restart monitors. Call once
    /// at process start before serving.
    pub async fn hydrate(&self) -> anyhow::Result<usize> {
        let selector: HashMap<String, String> =
            [("app".to_string(), POOL_RECORD_LABEL.to_string())].into();
        let records = self
            .cluster
            .list_records(&self.cfg.cluster.system_namespace, &selector)
            .await
            .map_err(|e| anyhow::anyhow!("listing pool records: {}", e))?;

        let mut loaded = 0;
        for record in records {
            let raw = match record.data.get(POOL_RECORD_KEY) {
                Some(raw) => raw,
                None => {
                    warn!(record = %record.name, "pool record has no data, skipping");
                    continue;
                }
            };
            let settings: PoolSettings = match serde_json::from_str(raw) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(record = %record.name, error = %e, "unparseable pool record, skipping");
                    continue;
                }
            };
            if settings.schema_version > POOL_SCHEMA_VERSION {
                warn!(
                    pool = %settings.name,
                    version = settings.schema_version,
                    "pool record has newer schema than supported ({})",
                    POOL_SCHEMA_VERSION
                );
            }

            let name = settings.name.clone();
            self.pools.write().await.insert(name.clone(), settings);
            self.scaling_locks
                .write()
                .await
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            self.start_monitor(name.clone()).await;
            info!(pool = %name, "loaded existing pool");
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Stop all pool monitors (bounded wait each). Pools and their
    /// workspaces stay on the cluster for the next process to pick up.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, MonitorHandle)> =
            self.monitors.lock().await.drain().collect();
        for (pool, handle) in handles {
            handle.stop(self.cfg.monitor.stop_timeout()).await;
            debug!(pool = %pool, "monitor stopped for shutdown");
        }
    }

    /// Create a pool: persist its configuration, run one synchronous
    /// reconciliation pass (callers observe at least an attempt at initial
    /// capacity), then start the background monitor.
    pub async fn create_pool(
        &self,
        caller: &Caller,
        spec: PoolSpec,
    ) -> Result<(PoolSettings, ReconcileOutcome), PoolError> {
        validate_pool_spec(&spec)?;
        if self.pools.read().await.contains_key(&spec.name) {
            return Err(PoolError::Validation(format!(
                "pool '{}' already exists",
                spec.name
            )));
        }

        let settings = PoolSettings {
            schema_version: POOL_SCHEMA_VERSION,
            name: spec.name.clone(),
            display_name: spec.display_name,
            minimum: spec.minimum,
            repos: spec.repos,
            credential_ref: spec.credential_ref,
            env: spec.env,
            overrides: spec.overrides,
            image: spec.image,
            cpu: spec.cpu.unwrap_or_else(|| self.cfg.defaults.cpu.clone()),
            memory: spec
                .memory
                .unwrap_or_else(|| self.cfg.defaults.memory.clone()),
            created_at: Utc::now(),
            owner: caller.principal.clone(),
        };

        // Persist before creating anything; a pool that cannot be stored
        // must not leave workspaces behind.
        self.persist(&settings).await?;

        let name = settings.name.clone();
        self.pools
            .write()
            .await
            .insert(name.clone(), settings.clone());
        let lock = self
            .scaling_locks
            .write()
            .await
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.reconcile_locked(&name).await
        };

        self.start_monitor(name.clone()).await;
        info!(
            pool = %name,
            minimum = settings.minimum,
            created = outcome.created,
            "pool created"
        );
        Ok((settings, outcome))
    }

    pub async fn get_pool(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<(PoolSettings, PoolStatus), PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        let status = self.pool_status(&settings).await;
        Ok((settings, status))
    }

    /// Status for every pool the caller may see.
    pub async fn list_pools(&self, caller: &Caller) -> Vec<PoolStatus> {
        let visible: Vec<PoolSettings> = self
            .pools
            .read()
            .await
            .values()
            .filter(|settings| caller.admin || settings.owner == caller.principal)
            .cloned()
            .collect();

        let mut out = Vec::with_capacity(visible.len());
        for settings in visible {
            out.push(self.pool_status(&settings).await);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Delete a pool: stop its monitor, tear down every member workspace
    /// (best effort), then remove the persisted configuration.
    pub async fn delete_pool(&self, caller: &Caller, name: &str) -> Result<(), PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;

        if let Some(handle) = self.monitors.lock().await.remove(name) {
            handle.stop(self.cfg.monitor.stop_timeout()).await;
        }

        for ws in self.store.list_pool(name).await {
            match self.provisioner.delete(&ws.id).await {
                Ok(()) => info!(pool = name, workspace_id = %ws.id, "deleted pool workspace"),
                Err(e) => {
                    warn!(pool = name, workspace_id = %ws.id, "failed to delete pool workspace: {:#}", e)
                }
            }
        }

        let record_name = pool_record_name(name);
        if let Err(e) = self
            .cluster
            .delete_record(&self.cfg.cluster.system_namespace, &record_name)
            .await
        {
            if !e.is_not_found() {
                return Err(PoolError::Persistence(e));
            }
        }

        self.pools.write().await.remove(name);
        self.scaling_locks.write().await.remove(name);
        info!(pool = name, "pool deleted");
        Ok(())
    }

    /// Change a pool's minimum size and run one reconciliation pass under
    /// the scaling lock. Returns (old minimum, new minimum, pass outcome).
    pub async fn scale_pool(
        &self,
        caller: &Caller,
        name: &str,
        new_minimum: u32,
    ) -> Result<(u32, u32, ReconcileOutcome), PoolError> {
        if new_minimum < 1 {
            return Err(PoolError::Validation(
                "minimum must be at least 1".to_string(),
            ));
        }
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;

        let lock = self
            .lock_for(name)
            .await
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        // Caller-visible operation: block on the lock rather than skipping.
        let _guard = lock.lock().await;

        let old_minimum = settings.minimum;
        let mut updated = settings;
        updated.minimum = new_minimum;
        self.persist(&updated).await?;
        self.pools
            .write()
            .await
            .insert(name.to_string(), updated);

        let outcome = self.reconcile_locked(name).await;
        info!(
            pool = name,
            old_minimum, new_minimum, "pool scaled"
        );
        Ok((old_minimum, new_minimum, outcome))
    }

    /// Apply a configuration update. A build-affecting change (anything but
    /// the display name) invalidates existing members: unused ones are
    /// deleted immediately and recreated lazily by the next reconciliation
    /// pass; used ones are flagged for recreation so the live session is
    /// not interrupted.
    pub async fn update_pool(
        &self,
        caller: &Caller,
        name: &str,
        update: PoolUpdate,
    ) -> Result<PoolSettings, PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;

        let lock = self
            .lock_for(name)
            .await
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        let _guard = lock.lock().await;

        let mut updated = settings.clone();
        if let Some(display_name) = update.display_name {
            updated.display_name = Some(display_name);
        }
        if let Some(repos) = update.repos {
            updated.repos = repos;
        }
        if let Some(credential_ref) = update.credential_ref {
            updated.credential_ref = Some(credential_ref);
        }
        if let Some(env) = update.env {
            updated.env = env;
        }
        if let Some(overrides) = update.overrides {
            updated.overrides = overrides;
        }
        if let Some(image) = update.image {
            updated.image = Some(image);
        }
        if let Some(cpu) = update.cpu {
            updated.cpu = cpu;
        }
        if let Some(memory) = update.memory {
            updated.memory = memory;
        }
        validate_settings(&updated)?;

        let build_affecting = updated.repos != settings.repos
            || updated.credential_ref != settings.credential_ref
            || updated.env != settings.env
            || updated.overrides != settings.overrides
            || updated.image != settings.image
            || updated.cpu != settings.cpu
            || updated.memory != settings.memory;

        self.persist(&updated).await?;
        self.pools
            .write()
            .await
            .insert(name.to_string(), updated.clone());

        if build_affecting {
            info!(pool = name, "build configuration changed, recycling members");
            self.handle_workspace_recreation(name, "pool build configuration changed")
                .await;
        }
        Ok(updated)
    }

    /// One API-triggered reconciliation pass, blocking on the scaling lock.
    pub async fn reconcile_pool(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<ReconcileOutcome, PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        let lock = self
            .lock_for(name)
            .await
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        let _guard = lock.lock().await;
        Ok(self.reconcile_locked(name).await)
    }

    /// Observed state of every member workspace.
    pub async fn list_pool_workspaces(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<Vec<Workspace>, PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        Ok(self.store.list_pool(name).await)
    }

    /// First workspace that is running, unused, and passes the strict
    /// health predicate.
    ///
    /// Deliberately lock-free: two concurrent callers can be handed the
    /// same workspace. The consumer of this interface tolerates the
    /// double-assignment race; serializing hand-outs here would put a
    /// global lock on the hot path for a conflict that callers already
    /// resolve.
    pub async fn get_available_workspace(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<Option<Workspace>, PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        Ok(self
            .store
            .list_pool(name)
            .await
            .into_iter()
            .find(|ws| ws.health == HealthState::Running && ws.is_unused() && ws.eligible))
    }

    /// Check a workspace out. Requires it to currently classify `running`
    /// and pass the strict hand-out predicate.
    pub async fn mark_used(
        &self,
        caller: &Caller,
        name: &str,
        workspace_id: &str,
        user_info: Option<String>,
    ) -> Result<Workspace, PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        let namespace = self.member_namespace(name, workspace_id).await?;

        let mut ws = self.store.observe(&namespace, name).await;
        if ws.health != HealthState::Running || !ws.eligible {
            return Err(PoolError::NotReady(workspace_id.to_string()));
        }

        let usage = UsageRecord::used(user_info);
        self.store
            .set_usage(&namespace, &usage)
            .await
            .map_err(PoolError::Persistence)?;
        ws.usage = usage;
        info!(pool = name, workspace_id, "workspace marked used");
        Ok(ws)
    }

    /// Release a workspace. If its recreation flag is set the release is
    /// converted into a deletion and the pool recreates capacity lazily on
    /// the next reconciliation pass.
    pub async fn mark_unused(
        &self,
        caller: &Caller,
        name: &str,
        workspace_id: &str,
    ) -> Result<ReleaseOutcome, PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        let namespace = self.member_namespace(name, workspace_id).await?;

        let flag = self.store.recreation(&namespace).await;
        if flag.flagged {
            self.provisioner
                .delete(workspace_id)
                .await
                .map_err(PoolError::Provision)?;
            info!(
                pool = name,
                workspace_id,
                reason = flag.reason.as_deref().unwrap_or("unknown"),
                "flagged workspace deleted on release"
            );
            return Ok(ReleaseOutcome::Deleted);
        }

        self.store
            .set_usage(&namespace, &UsageRecord::unused())
            .await
            .map_err(PoolError::Persistence)?;
        info!(pool = name, workspace_id, "workspace released");
        Ok(ReleaseOutcome::Released)
    }

    pub async fn get_workspace_usage(
        &self,
        caller: &Caller,
        name: &str,
        workspace_id: &str,
    ) -> Result<UsageRecord, PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        let namespace = self.member_namespace(name, workspace_id).await?;
        Ok(self.store.usage(&namespace).await)
    }

    /// Delete a single member workspace.
    pub async fn delete_pool_workspace(
        &self,
        caller: &Caller,
        name: &str,
        workspace_id: &str,
    ) -> Result<(), PoolError> {
        let settings = self.settings(name).await?;
        self.authorize(caller, &settings)?;
        self.member_namespace(name, workspace_id).await?;
        self.provisioner
            .delete(workspace_id)
            .await
            .map_err(PoolError::Provision)?;
        info!(pool = name, workspace_id, "workspace deleted by request");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn settings(&self, name: &str) -> Result<PoolSettings, PoolError> {
        self.pools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(name.to_string()))
    }

    fn authorize(&self, caller: &Caller, settings: &PoolSettings) -> Result<(), PoolError> {
        if caller.admin || settings.owner == caller.principal {
            Ok(())
        } else {
            Err(PoolError::Forbidden(caller.principal.clone()))
        }
    }

    async fn lock_for(&self, name: &str) -> Option<Arc<Mutex<()>>> {
        self.scaling_locks.read().await.get(name).cloned()
    }

    async fn persist(&self, settings: &PoolSettings) -> Result<(), PoolError> {
        let raw = serde_json::to_string(settings)
            .map_err(|e| PoolError::Persistence(ClusterError::Api(e.to_string())))?;
        let record = KvRecord::new(pool_record_name(&settings.name))
            .with_label("app", POOL_RECORD_LABEL)
            .with_label(
                self.cfg.cluster.pool_label.as_str(),
                sanitize_label(&settings.name),
            )
            .with_data(POOL_RECORD_KEY, raw);
        self.cluster
            .write_record(&self.cfg.cluster.system_namespace, &record)
            .await
            .map_err(PoolError::Persistence)
    }

    async fn pool_status(&self, settings: &PoolSettings) -> PoolStatus {
        let workspaces = self.store.list_pool(&settings.name).await;
        let counts = StateCounts::tally(&workspaces);
        PoolStatus {
            name: settings.name.clone(),
            minimum: settings.minimum,
            total: counts.total,
            running: counts.running,
            pending: counts.pending,
            failed: counts.failed,
            used: counts.used,
            unused: counts.unused,
            workspaces,
        }
    }

    /// Resolve a workspace id to its namespace and verify pool membership.
    async fn member_namespace(
        &self,
        pool: &str,
        workspace_id: &str,
    ) -> Result<String, PoolError> {
        let namespace = self.store.namespace_for(workspace_id);
        let labels = match self.cluster.namespace_labels(&namespace).await {
            Ok(labels) => labels,
            Err(e) if e.is_not_found() => {
                return Err(PoolError::WorkspaceNotFound(workspace_id.to_string()))
            }
            Err(e) => return Err(PoolError::Persistence(e)),
        };
        if labels.get(&self.cfg.cluster.pool_label) != Some(&sanitize_label(pool)) {
            return Err(PoolError::NotAMember {
                workspace: workspace_id.to_string(),
                pool: pool.to_string(),
            });
        }
        Ok(namespace)
    }

    fn workspace_spec(&self, settings: &PoolSettings) -> WorkspaceSpec {
        WorkspaceSpec {
            repos: settings.repos.clone(),
            credential_ref: settings.credential_ref.clone(),
            env: settings.env.clone(),
            overrides: settings.overrides.clone(),
            image: settings.image.clone().unwrap_or(ImageSpec::Base {
                image: self.cfg.defaults.image.clone(),
                dev_container: true,
            }),
            cpu: settings.cpu.clone(),
            memory: settings.memory.clone(),
        }
    }

    /// One reconciliation pass. Callers must hold the pool's scaling lock.
    ///
    /// Issues exactly `needed` independent creation requests; a single
    /// failure is logged and counted but never aborts the rest of the pass.
    async fn reconcile_locked(&self, name: &str) -> ReconcileOutcome {
        let settings = match self.pools.read().await.get(name).cloned() {
            Some(settings) => settings,
            None => {
                warn!(pool = name, "reconcile requested for unknown pool");
                return ReconcileOutcome::default();
            }
        };

        let workspaces = self.store.list_pool(name).await;
        let counts = StateCounts::tally(&workspaces);
        let plan = ReconcilePlan::compute(settings.minimum, &counts);

        if plan.needed == 0 {
            debug!(
                pool = name,
                minimum = plan.minimum,
                active = plan.active,
                "pool does not need scaling"
            );
            return ReconcileOutcome {
                requested: 0,
                created: 0,
            };
        }

        info!(
            pool = name,
            minimum = plan.minimum,
            running = counts.running,
            pending = counts.pending,
            failed = counts.failed,
            needed = plan.needed,
            "pool below minimum, creating workspaces"
        );

        let spec = self.workspace_spec(&settings);
        let mut created = 0;
        for _ in 0..plan.needed {
            match self.provisioner.create(&spec).await {
                Ok(workspace_id) => {
                    if let Err(e) = self.adopt_workspace(name, &workspace_id).await {
                        warn!(
                            pool = name,
                            workspace_id = %workspace_id,
                            error = %e,
                            "created workspace could not be labeled for the pool"
                        );
                    }
                    created += 1;
                    info!(
                        pool = name,
                        workspace_id = %workspace_id,
                        "created pool workspace ({}/{})",
                        created,
                        plan.needed
                    );
                }
                Err(e) => {
                    error!(pool = name, "workspace creation failed: {:#}", e);
                }
            }
        }

        info!(
            pool = name,
            created,
            requested = plan.needed,
            "reconciliation pass complete"
        );
        ReconcileOutcome {
            requested: plan.needed,
            created,
        }
    }

    /// Tag a freshly provisioned workspace as a pool member and record it
    /// as unused.
    async fn adopt_workspace(
        &self,
        pool: &str,
        workspace_id: &str,
    ) -> crate::cluster::Result<()> {
        let namespace = self.store.namespace_for(workspace_id);
        let labels: HashMap<String, String> = [(
            self.cfg.cluster.pool_label.clone(),
            sanitize_label(pool),
        )]
        .into();
        self.cluster
            .patch_namespace_labels(&namespace, &labels)
            .await?;
        self.store
            .set_usage(&namespace, &UsageRecord::unused())
            .await
    }

    /// React to a build-affecting configuration change: delete unused
    /// members now, flag used members for recreation on release. All best
    /// effort; failures are logged and the next pass converges.
    async fn handle_workspace_recreation(&self, name: &str, reason: &str) {
        for ws in self.store.list_pool(name).await {
            if ws.is_unused() {
                match self.provisioner.delete(&ws.id).await {
                    Ok(()) => {
                        info!(pool = name, workspace_id = %ws.id, "stale unused workspace deleted")
                    }
                    Err(e) => {
                        warn!(pool = name, workspace_id = %ws.id, "failed to delete stale workspace: {:#}", e)
                    }
                }
            } else if let Err(e) = self.store.flag_recreation(&ws.namespace, reason).await {
                warn!(pool = name, workspace_id = %ws.id, error = %e, "failed to flag workspace for recreation");
            } else {
                info!(pool = name, workspace_id = %ws.id, "in-use workspace flagged for recreation");
            }
        }
    }

    /// One background monitor tick. Returns false when the pool no longer
    /// exists and the monitor should exit.
    async fn monitor_tick(&self, name: &str) -> bool {
        let Some(lock) = self.lock_for(name).await else {
            warn!(pool = name, "pool no longer exists, stopping monitor");
            return false;
        };
        match lock.try_lock() {
            Ok(_guard) => {
                self.reconcile_locked(name).await;
            }
            Err(_) => {
                // A concurrent scale or update is already reconciling.
                debug!(pool = name, "scaling already in progress, skipping tick");
            }
        }
        true
    }

    async fn start_monitor(&self, name: String) {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(&name) {
            return;
        }
        let handle = MonitorHandle::spawn(
            self.weak.clone(),
            name.clone(),
            self.cfg.monitor.grace(),
            self.cfg.monitor.interval(),
        );
        monitors.insert(name, handle);
    }
}

fn pool_record_name(pool: &str) -> String {
    format!("pool-{}", sanitize_name(pool))
}

fn valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_pool_spec(spec: &PoolSpec) -> Result<(), PoolError> {
    if spec.name.trim().is_empty() {
        return Err(PoolError::Validation("pool name cannot be empty".into()));
    }
    if spec.name.len() > 253 {
        return Err(PoolError::Validation(
            "pool name is too long (max 253 characters)".into(),
        ));
    }
    if spec.minimum < 1 {
        return Err(PoolError::Validation("minimum must be at least 1".into()));
    }
    if spec.repos.is_empty() {
        return Err(PoolError::Validation(
            "at least one repository is required".into(),
        ));
    }
    for repo in &spec.repos {
        if repo.url.trim().is_empty() || repo.branch.trim().is_empty() {
            return Err(PoolError::Validation(
                "repository url and branch cannot be empty".into(),
            ));
        }
    }
    for var in &spec.env {
        if !valid_env_name(&var.name) {
            return Err(PoolError::Validation(format!(
                "invalid environment variable name '{}'",
                var.name
            )));
        }
    }
    Ok(())
}

fn validate_settings(settings: &PoolSettings) -> Result<(), PoolError> {
    if settings.repos.is_empty() {
        return Err(PoolError::Validation(
            "at least one repository is required".into(),
        ));
    }
    for repo in &settings.repos {
        if repo.url.trim().is_empty() || repo.branch.trim().is_empty() {
            return Err(PoolError::Validation(
                "repository url and branch cannot be empty".into(),
            ));
        }
    }
    for var in &settings.env {
        if !valid_env_name(&var.name) {
            return Err(PoolError::Validation(format!(
                "invalid environment variable name '{}'",
                var.name
            )));
        }
    }
    Ok(())
}
