//! In-memory cluster used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ClusterClient, ClusterError, KvRecord, PodFacts, Result, WorkloadSpec};

/// In-memory `ClusterClient` backed by maps, with failure switches for
/// exercising degraded paths.
#[derive(Default)]
pub struct FakeCluster {
    namespaces: RwLock<HashMap<String, HashMap<String, String>>>,
    pods: RwLock<HashMap<String, Vec<PodFacts>>>,
    records: RwLock<HashMap<(String, String), KvRecord>>,
    workloads: RwLock<HashMap<(String, String), WorkloadSpec>>,
    /// When set, every record write fails.
    pub fail_record_writes: AtomicBool,
    /// When set, every record read fails (with a non-NotFound error).
    pub fail_record_reads: AtomicBool,
    /// When set, every workload create fails.
    pub fail_workload_creates: AtomicBool,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.read().await.contains_key(name)
    }

    pub async fn namespace_count(&self) -> usize {
        self.namespaces.read().await.len()
    }

    /// Seed the pods visible in a namespace.
    pub async fn set_pods(&self, namespace: &str, pods: Vec<PodFacts>) {
        self.pods.write().await.insert(namespace.to_string(), pods);
    }

    pub async fn record(&self, namespace: &str, name: &str) -> Option<KvRecord> {
        self.records
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn selector_matches(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_namespace(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(name) {
            return Err(ClusterError::Api(format!("namespace '{}' already exists", name)));
        }
        namespaces.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn namespace_labels(&self, name: &str) -> Result<HashMap<String, String>> {
        self.namespaces
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("namespace", name))
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        let existing = namespaces
            .get_mut(name)
            .ok_or_else(|| ClusterError::not_found("namespace", name))?;
        existing.extend(labels.clone());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let removed = self.namespaces.write().await.remove(name);
        if removed.is_none() {
            return Err(ClusterError::not_found("namespace", name));
        }
        // Deleting a namespace takes everything in it along.
        self.pods.write().await.remove(name);
        self.records
            .write()
            .await
            .retain(|(ns, _), _| ns != name);
        self.workloads
            .write()
            .await
            .retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn list_namespaces(&self, selector: &HashMap<String, String>) -> Result<Vec<String>> {
        let namespaces = self.namespaces.read().await;
        let mut names: Vec<String> = namespaces
            .iter()
            .filter(|(_, labels)| Self::selector_matches(labels, selector))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        _selector: &HashMap<String, String>,
    ) -> Result<Vec<PodFacts>> {
        Ok(self
            .pods
            .read()
            .await
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_record(&self, namespace: &str, name: &str) -> Result<KvRecord> {
        if self.fail_record_reads.load(Ordering::SeqCst) {
            return Err(ClusterError::Api("injected read failure".into()));
        }
        self.records
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "record",
                name: name.to_string(),
            })
    }

    async fn write_record(&self, namespace: &str, record: &KvRecord) -> Result<()> {
        if self.fail_record_writes.load(Ordering::SeqCst) {
            return Err(ClusterError::Api("injected write failure".into()));
        }
        self.records
            .write()
            .await
            .insert((namespace.to_string(), record.name.clone()), record.clone());
        Ok(())
    }

    async fn delete_record(&self, namespace: &str, name: &str) -> Result<()> {
        let removed = self
            .records
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                kind: "record",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn list_records(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<KvRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<KvRecord> = records
            .iter()
            .filter(|((ns, _), rec)| ns == namespace && Self::selector_matches(&rec.labels, selector))
            .map(|(_, rec)| rec.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> Result<()> {
        if self.fail_workload_creates.load(Ordering::SeqCst) {
            return Err(ClusterError::Api("injected workload failure".into()));
        }
        if !self.namespaces.read().await.contains_key(namespace) {
            return Err(ClusterError::not_found("namespace", namespace));
        }
        self.workloads
            .write()
            .await
            .insert((namespace.to_string(), spec.name.clone()), spec.clone());
        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        let removed = self
            .workloads
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                kind: "workload",
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn namespace_lifecycle() {
        let cluster = FakeCluster::new();
        cluster
            .create_namespace("workspace-a", &labels(&[("app", "workspace")]))
            .await
            .unwrap();
        assert!(cluster.has_namespace("workspace-a").await);

        cluster
            .patch_namespace_labels("workspace-a", &labels(&[("pool", "dev")]))
            .await
            .unwrap();
        let got = cluster.namespace_labels("workspace-a").await.unwrap();
        assert_eq!(got.get("pool").unwrap(), "dev");
        assert_eq!(got.get("app").unwrap(), "workspace");

        cluster.delete_namespace("workspace-a").await.unwrap();
        let err = cluster.namespace_labels("workspace-a").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_namespaces_by_selector() {
        let cluster = FakeCluster::new();
        cluster
            .create_namespace("workspace-a", &labels(&[("app", "workspace"), ("pool", "dev")]))
            .await
            .unwrap();
        cluster
            .create_namespace("workspace-b", &labels(&[("app", "workspace"), ("pool", "prod")]))
            .await
            .unwrap();

        let dev = cluster
            .list_namespaces(&labels(&[("app", "workspace"), ("pool", "dev")]))
            .await
            .unwrap();
        assert_eq!(dev, vec!["workspace-a"]);

        let all = cluster
            .list_namespaces(&labels(&[("app", "workspace")]))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn records_write_read_delete() {
        let cluster = FakeCluster::new();
        let rec = KvRecord::new("workspace-usage").with_data("usage.json", "{}");
        cluster.write_record("workspace-a", &rec).await.unwrap();

        let got = cluster.read_record("workspace-a", "workspace-usage").await.unwrap();
        assert_eq!(got.data.get("usage.json").unwrap(), "{}");

        cluster
            .delete_record("workspace-a", "workspace-usage")
            .await
            .unwrap();
        assert!(cluster
            .read_record("workspace-a", "workspace-usage")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn deleting_namespace_removes_contents() {
        let cluster = FakeCluster::new();
        cluster
            .create_namespace("workspace-a", &HashMap::new())
            .await
            .unwrap();
        cluster
            .write_record("workspace-a", &KvRecord::new("r").with_data("k", "v"))
            .await
            .unwrap();
        cluster.delete_namespace("workspace-a").await.unwrap();
        assert!(cluster
            .read_record("workspace-a", "r")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn injected_write_failure() {
        let cluster = FakeCluster::new();
        cluster.fail_record_writes.store(true, Ordering::SeqCst);
        let err = cluster
            .write_record("ns", &KvRecord::new("r"))
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
    }
}
