//! YAML manifests loaded from disk.

use std::path::Path;

use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Result;

/// Parse a single-document YAML manifest into `K`
pub fn parse_manifest<K>(yaml: &str, namespace: Option<&str>) -> Result<K>
where
    K: Resource + DeserializeOwned,
{
    let mut obj: K = serde_yaml::from_str(yaml)?;
    if let Some(ns) = namespace {
        obj.meta_mut().namespace = Some(ns.to_string());
    }
    Ok(obj)
}

/// Read a manifest file and place the object in `namespace`
pub async fn load_manifest<K>(path: impl AsRef<Path>, namespace: Option<&str>) -> Result<K>
where
    K: Resource + DeserializeOwned,
{
    let path = path.as_ref();
    let yaml = tokio::fs::read_to_string(path).await?;
    debug!(path = %path.display(), "Loaded manifest");
    parse_manifest(&yaml, namespace)
}
