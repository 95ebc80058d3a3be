//! `ClusterClient` implementation against the orchestrator's REST API.
//!
//! Only the handful of object kinds the controller touches are mapped:
//! namespaces, pods (read-only), config-backed records, and deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ClusterConfig;

use super::{
    ClusterClient, ClusterError, ContainerFacts, KvRecord, PodFacts, Result, Termination,
    WorkloadSpec,
};

pub struct RestClusterClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClusterClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }

    /// Build a client from daemon configuration, reading the bearer token
    /// file if one is configured.
    pub fn from_config(cfg: &ClusterConfig) -> anyhow::Result<Self> {
        let base_url = cfg
            .api_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cluster.api_url is not configured"))?;
        let token = match &cfg.token_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map(|t| t.trim().to_string())
                    .map_err(|e| anyhow::anyhow!("reading token file {}: {}", path.display(), e))?,
            ),
            None => None,
        };
        Self::new(base_url, token)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<(&str, String)>,
        body: Option<Value>,
        merge_patch: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, path, "cluster api request");

        let mut req = self.client.request(method, &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some((key, value)) = query {
            req = req.query(&[(key, value)]);
        }
        if let Some(body) = body {
            if merge_patch {
                req = req.header("Content-Type", "application/merge-patch+json");
            }
            req = req.json(&body);
        }

        req.send()
            .await
            .map_err(|e| ClusterError::Api(format!("request to {} failed: {}", url, e)))
    }

    async fn expect_ok(
        resp: reqwest::Response,
        kind: &'static str,
        name: &str,
    ) -> Result<Value> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClusterError::not_found(kind, name));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| ClusterError::Api(format!("reading response body: {}", e)))?;
        if !status.is_success() {
            return Err(ClusterError::Api(format!(
                "{} '{}': status {}: {}",
                kind,
                name,
                status,
                text.trim()
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| ClusterError::Api(format!("decoding response for {} '{}': {}", kind, name, e)))
    }
}

/// Render a label map as a `k=v,k2=v2` selector string, sorted for
/// deterministic request URLs.
fn selector_string(selector: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.sort();
    pairs.join(",")
}

fn parse_termination(value: &Value) -> Option<Termination> {
    let terminated = value.get("terminated")?;
    Some(Termination {
        exit_code: terminated.get("exitCode").and_then(Value::as_i64).unwrap_or(0) as i32,
        finished_at: terminated
            .get("finishedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

/// Map a pod object from the cluster API into the facts the health
/// classifier consumes.
fn parse_pod_facts(pod: &Value) -> PodFacts {
    let status = pod.get("status").cloned().unwrap_or(Value::Null);
    let phase = status
        .get("phase")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    let ip = status
        .get("podIP")
        .and_then(Value::as_str)
        .map(str::to_string);

    let containers = status
        .get("containerStatuses")
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| ContainerFacts {
                    name: cs
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    ready: cs.get("ready").and_then(Value::as_bool).unwrap_or(false),
                    restart_count: cs
                        .get("restartCount")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    waiting_reason: cs
                        .get("state")
                        .and_then(|s| s.get("waiting"))
                        .and_then(|w| w.get("reason"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    terminated: cs.get("state").and_then(parse_termination),
                    last_termination: cs.get("lastState").and_then(parse_termination),
                })
                .collect()
        })
        .unwrap_or_default();

    PodFacts { phase, ip, containers }
}

fn record_from_value(value: &Value) -> KvRecord {
    let name = value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let labels = value
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let data = value
        .get("data")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    KvRecord { name, labels, data }
}

fn record_body(record: &KvRecord) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": record.name, "labels": record.labels },
        "data": record.data,
    })
}

#[async_trait]
impl ClusterClient for RestClusterClient {
    async fn create_namespace(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": labels },
        });
        let resp = self
            .request(Method::POST, "/api/v1/namespaces", None, Some(body), false)
            .await?;
        Self::expect_ok(resp, "namespace", name).await?;
        Ok(())
    }

    async fn namespace_labels(&self, name: &str) -> Result<HashMap<String, String>> {
        let resp = self
            .request(
                Method::GET,
                &format!("/api/v1/namespaces/{}", name),
                None,
                None,
                false,
            )
            .await?;
        let value = Self::expect_ok(resp, "namespace", name).await?;
        Ok(value
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let body = json!({ "metadata": { "labels": labels } });
        let resp = self
            .request(
                Method::PATCH,
                &format!("/api/v1/namespaces/{}", name),
                None,
                Some(body),
                true,
            )
            .await?;
        Self::expect_ok(resp, "namespace", name).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let resp = self
            .request(
                Method::DELETE,
                &format!("/api/v1/namespaces/{}", name),
                None,
                None,
                false,
            )
            .await?;
        Self::expect_ok(resp, "namespace", name).await?;
        Ok(())
    }

    async fn list_namespaces(&self, selector: &HashMap<String, String>) -> Result<Vec<String>> {
        let resp = self
            .request(
                Method::GET,
                "/api/v1/namespaces",
                Some(("labelSelector", selector_string(selector))),
                None,
                false,
            )
            .await?;
        let value = Self::expect_ok(resp, "namespace", "list").await?;
        Ok(value
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.pointer("/metadata/name")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<PodFacts>> {
        let resp = self
            .request(
                Method::GET,
                &format!("/api/v1/namespaces/{}/pods", namespace),
                Some(("labelSelector", selector_string(selector))),
                None,
                false,
            )
            .await?;
        let value = Self::expect_ok(resp, "pod", "list").await?;
        Ok(value
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_pod_facts).collect())
            .unwrap_or_default())
    }

    async fn read_record(&self, namespace: &str, name: &str) -> Result<KvRecord> {
        let resp = self
            .request(
                Method::GET,
                &format!("/api/v1/namespaces/{}/configmaps/{}", namespace, name),
                None,
                None,
                false,
            )
            .await?;
        let value = Self::expect_ok(resp, "record", name).await?;
        Ok(record_from_value(&value))
    }

    async fn write_record(&self, namespace: &str, record: &KvRecord) -> Result<()> {
        let resp = self
            .request(
                Method::POST,
                &format!("/api/v1/namespaces/{}/configmaps", namespace),
                None,
                Some(record_body(record)),
                false,
            )
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            // Already exists: replace it.
            let resp = self
                .request(
                    Method::PUT,
                    &format!("/api/v1/namespaces/{}/configmaps/{}", namespace, record.name),
                    None,
                    Some(record_body(record)),
                    false,
                )
                .await?;
            Self::expect_ok(resp, "record", &record.name).await?;
            return Ok(());
        }
        Self::expect_ok(resp, "record", &record.name).await?;
        Ok(())
    }

    async fn delete_record(&self, namespace: &str, name: &str) -> Result<()> {
        let resp = self
            .request(
                Method::DELETE,
                &format!("/api/v1/namespaces/{}/configmaps/{}", namespace, name),
                None,
                None,
                false,
            )
            .await?;
        Self::expect_ok(resp, "record", name).await?;
        Ok(())
    }

    async fn list_records(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<KvRecord>> {
        let resp = self
            .request(
                Method::GET,
                &format!("/api/v1/namespaces/{}/configmaps", namespace),
                Some(("labelSelector", selector_string(selector))),
                None,
                false,
            )
            .await?;
        let value = Self::expect_ok(resp, "record", "list").await?;
        Ok(value
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(record_from_value).collect())
            .unwrap_or_default())
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> Result<()> {
        let env: Vec<Value> = spec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let body = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": spec.name, "labels": spec.labels },
            "spec": {
                "replicas": spec.replicas,
                "selector": { "matchLabels": spec.labels },
                "template": {
                    "metadata": { "labels": spec.labels },
                    "spec": {
                        "containers": [{
                            "name": spec.name,
                            "image": spec.image,
                            "env": env,
                            "resources": {
                                "requests": { "cpu": spec.cpu, "memory": spec.memory },
                            },
                        }],
                    },
                },
            },
        });
        let resp = self
            .request(
                Method::POST,
                &format!("/apis/apps/v1/namespaces/{}/deployments", namespace),
                None,
                Some(body),
                false,
            )
            .await?;
        Self::expect_ok(resp, "workload", &spec.name).await?;
        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        let resp = self
            .request(
                Method::DELETE,
                &format!("/apis/apps/v1/namespaces/{}/deployments/{}", namespace, name),
                None,
                None,
                false,
            )
            .await?;
        Self::expect_ok(resp, "workload", name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_string_is_sorted() {
        let mut selector = HashMap::new();
        selector.insert("pool".to_string(), "dev".to_string());
        selector.insert("app".to_string(), "workspace".to_string());
        assert_eq!(selector_string(&selector), "app=workspace,pool=dev");
    }

    #[test]
    fn parse_pod_facts_full_status() {
        let pod = json!({
            "status": {
                "phase": "Running",
                "podIP": "10.1.2.3",
                "containerStatuses": [{
                    "name": "workspace",
                    "ready": true,
                    "restartCount": 2,
                    "state": { "running": { "startedAt": "2026-01-01T00:00:00Z" } },
                    "lastState": {
                        "terminated": {
                            "exitCode": 137,
                            "finishedAt": "2026-01-01T00:00:00Z"
                        }
                    }
                }]
            }
        });
        let facts = parse_pod_facts(&pod);
        assert_eq!(facts.phase, "Running");
        assert_eq!(facts.ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(facts.containers.len(), 1);
        let c = &facts.containers[0];
        assert!(c.ready);
        assert_eq!(c.restart_count, 2);
        assert!(c.waiting_reason.is_none());
        assert!(c.terminated.is_none());
        let last = c.last_termination.as_ref().unwrap();
        assert_eq!(last.exit_code, 137);
        assert!(last.finished_at.is_some());
    }

    #[test]
    fn parse_pod_facts_waiting_reason() {
        let pod = json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "workspace",
                    "ready": false,
                    "restartCount": 1,
                    "state": { "waiting": { "reason": "CrashLoopBackOff" } }
                }]
            }
        });
        let facts = parse_pod_facts(&pod);
        assert_eq!(
            facts.containers[0].waiting_reason.as_deref(),
            Some("CrashLoopBackOff")
        );
    }

    #[test]
    fn parse_pod_facts_missing_status() {
        let facts = parse_pod_facts(&json!({}));
        assert_eq!(facts.phase, "Unknown");
        assert!(facts.ip.is_none());
        assert!(facts.containers.is_empty());
    }

    #[test]
    fn record_roundtrip_through_body() {
        let rec = KvRecord::new("image-cache")
            .with_label("app", "workspace-image-cache")
            .with_data("cache", "{}");
        let parsed = record_from_value(&record_body(&rec));
        assert_eq!(parsed.name, rec.name);
        assert_eq!(parsed.labels, rec.labels);
        assert_eq!(parsed.data, rec.data);
    }
}
