//! Build-artifact cache.
//!
//! Building a workspace image is expensive; when a pool's build-relevant
//! configuration has not changed since the last build, the previously built
//! image is reused. The cache key is a fingerprint of everything that feeds
//! the build: resolved source commits, image selection, override file
//! contents, and resource sizing. Cache I/O is strictly best-effort: every
//! failure degrades to a miss or a no-op, never an error.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, KvRecord};
use crate::config::CacheConfig;
use crate::git;
use crate::provision::{ImageSpec, RepoSource, WorkspaceSpec};

use registry::ImageRegistry;

/// Record name for the cache in the system namespace.
pub const CACHE_RECORD: &str = "image-cache";
const CACHE_KEY: &str = "cache";

/// Marker substituted when a repository's head commit cannot be resolved,
/// so one unreachable remote does not fail the whole key derivation.
const COMMIT_FALLBACK: &str = "fallback";

/// One cached build result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The built workspace image.
    pub image: String,
    /// The base image the build started from.
    pub base_image: String,
    pub created: DateTime<Utc>,
    /// Fingerprint inputs echoed for inspection.
    pub repos: Vec<RepoSource>,
    pub image_spec: ImageSpec,
}

pub struct BuildCache {
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<dyn ImageRegistry>,
    system_namespace: String,
    max_entries: usize,
    git_timeout: Duration,
}

impl BuildCache {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<dyn ImageRegistry>,
        system_namespace: impl Into<String>,
        cfg: &CacheConfig,
    ) -> Self {
        Self {
            cluster,
            registry,
            system_namespace: system_namespace.into(),
            max_entries: cfg.max_entries,
            git_timeout: cfg.git_timeout(),
        }
    }

    /// Derive the cache key for a build configuration.
    ///
    /// Components are rendered as `label:value` strings and sorted before
    /// hashing, so the key does not depend on the order in which the
    /// configuration lists its repositories or any other input.
    pub async fn cache_key(&self, spec: &WorkspaceSpec) -> String {
        let mut components: Vec<String> = Vec::new();

        for repo in &spec.repos {
            let commit = git::remote_head(&repo.url, &repo.branch, self.git_timeout)
                .await
                .unwrap_or_else(|| COMMIT_FALLBACK.to_string());
            components.push(format!("repo:{}:{}:{}", repo.url, repo.branch, commit));
        }

        match &spec.image {
            ImageSpec::Direct { url } => {
                components.push(format!("custom_image_url:{}", url));
            }
            ImageSpec::Base {
                image,
                dev_container,
            } => {
                components.push(format!("custom_image:{}", image));
                components.push(format!("use_dev_container:{}", dev_container));
            }
        }

        for (label, content) in spec.overrides.present() {
            components.push(format!("container_file_{}:{}", label, hex_digest(content)));
        }

        components.push(format!("cpu:{}", spec.cpu.trim()));
        components.push(format!("memory:{}", spec.memory.trim()));

        components.sort();
        let key = short_digest(&components.join("|"));
        debug!(key = %key, components = components.len(), "derived cache key");
        key
    }

    /// Look up a build configuration. A hit is only reported when the
    /// recorded image still exists in the registry; a stale entry is
    /// removed and reported as a miss.
    pub async fn lookup(&self, spec: &WorkspaceSpec) -> Option<CacheEntry> {
        let key = self.cache_key(spec).await;
        self.lookup_key(&key).await
    }

    /// Look up a precomputed key.
    pub async fn lookup_key(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.read_entries().await;
        let entry = entries.get(key)?.clone();

        if self.registry.exists(&entry.image).await {
            info!(key, image = %entry.image, "image cache hit");
            return Some(entry);
        }

        info!(key, image = %entry.image, "cached image no longer in registry, evicting");
        entries.remove(key);
        self.write_entries(&entries).await;
        None
    }

    /// Record a completed build. Returns the key the entry was stored
    /// under. Failures are logged; the cache is an optimization, never a
    /// correctness dependency.
    pub async fn store(&self, spec: &WorkspaceSpec, image: &str, base_image: &str) -> String {
        let key = self.cache_key(spec).await;
        let mut entries = self.read_entries().await;

        entries.insert(
            key.clone(),
            CacheEntry {
                image: image.to_string(),
                base_image: base_image.to_string(),
                created: Utc::now(),
                repos: spec.repos.clone(),
                image_spec: spec.image.clone(),
            },
        );

        if entries.len() > self.max_entries {
            let mut by_age: Vec<(String, DateTime<Utc>)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.created))
                .collect();
            by_age.sort_by(|a, b| b.1.cmp(&a.1));
            let keep: std::collections::HashSet<String> = by_age
                .into_iter()
                .take(self.max_entries)
                .map(|(k, _)| k)
                .collect();
            let before = entries.len();
            entries.retain(|k, _| keep.contains(k));
            info!(
                dropped = before - entries.len(),
                retained = entries.len(),
                "evicted oldest cache entries"
            );
        }

        self.write_entries(&entries).await;
        info!(key = %key, image, "stored image cache entry");
        key
    }

    /// All current entries. Failures produce an empty map.
    pub async fn list(&self) -> HashMap<String, CacheEntry> {
        self.read_entries().await
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.write_entries(&HashMap::new()).await;
        info!("image cache cleared");
    }

    async fn read_entries(&self) -> HashMap<String, CacheEntry> {
        match self
            .cluster
            .read_record(&self.system_namespace, CACHE_RECORD)
            .await
        {
            Ok(record) => record
                .data
                .get(CACHE_KEY)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            Err(e) => {
                if !e.is_not_found() {
                    warn!(error = %e, "cache read failed, treating as empty");
                }
                HashMap::new()
            }
        }
    }

    async fn write_entries(&self, entries: &HashMap<String, CacheEntry>) {
        let raw = match serde_json::to_string(entries) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "cache encoding failed, skipping write");
                return;
            }
        };
        let record = KvRecord::new(CACHE_RECORD)
            .with_label("app", "workspace-image-cache")
            .with_data(CACHE_KEY, raw);
        if let Err(e) = self
            .cluster
            .write_record(&self.system_namespace, &record)
            .await
        {
            warn!(error = %e, "cache write failed, continuing without");
        }
    }
}

fn hex_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn short_digest(content: &str) -> String {
    hex_digest(content)[..16].to_string()
}
