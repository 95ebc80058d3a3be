//! Image registry existence checks.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Remote registry lookup. "Not found" is a normal negative result, and any
/// transport or auth failure also reports `false` so the cache degrades to
/// a rebuild instead of an error.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn exists(&self, image: &str) -> bool;
}

/// Existence check against a registry's HTTP API (v2 manifest endpoint).
pub struct HttpImageRegistry {
    client: reqwest::Client,
}

impl HttpImageRegistry {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

/// Split an image reference into (registry host, repository, tag).
///
/// `registry.acme.dev/team/app:v3` -> ("registry.acme.dev", "team/app", "v3")
/// References without a registry host resolve against the public hub, and a
/// missing tag means `latest`.
fn parse_reference(image: &str) -> (String, String, String) {
    let (rest, tag) = match image.rsplit_once(':') {
        Some((rest, tag)) if !tag.contains('/') => (rest, tag),
        _ => (image, "latest"),
    };

    match rest.split_once('/') {
        // A first segment with a dot or port is a registry host.
        Some((host, repo)) if host.contains('.') || host.contains(':') => {
            (host.to_string(), repo.to_string(), tag.to_string())
        }
        Some(_) => (
            "registry-1.docker.io".to_string(),
            rest.to_string(),
            tag.to_string(),
        ),
        None => (
            "registry-1.docker.io".to_string(),
            format!("library/{}", rest),
            tag.to_string(),
        ),
    }
}

#[async_trait]
impl ImageRegistry for HttpImageRegistry {
    async fn exists(&self, image: &str) -> bool {
        let (host, repo, tag) = parse_reference(image);
        let url = format!("https://{}/v2/{}/manifests/{}", host, repo, tag);

        let resp = self
            .client
            .head(&url)
            .header(
                "Accept",
                "application/vnd.oci.image.manifest.v1+json, \
                 application/vnd.docker.distribution.manifest.v2+json",
            )
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => {
                debug!(image, "image present in registry");
                true
            }
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                debug!(image, "image not found in registry");
                false
            }
            Ok(resp) => {
                warn!(image, status = %resp.status(), "registry check failed, assuming missing");
                false
            }
            Err(e) => {
                warn!(image, error = %e, "registry check failed, assuming missing");
                false
            }
        }
    }
}
