//! Manifest directory loader.
//!
//! Every `*.json`, `*.yaml` and `*.yml` file in the configured directory is
//! read as one or more manifest documents:
//!
//! ```yaml
//! kind: ConfigRequest
//! metadata: { name: edge, namespace: default }
//! spec:
//!   nodeID: edge-1
//!   resources:
//!     - type: cluster
//!       value: '{"name": "backend"}'
//! ---
//! kind: Secret
//! metadata: { name: edge-cert }
//! type: tls
//! data: { tls.crt: "...", tls.key: "..." }
//! ```
//!
//! A JSON file holds one document or an array of documents; a YAML file may
//! hold several `---` separated documents. A sync creates new objects,
//! updates changed ones and deletes objects whose manifest disappeared. A
//! file that fails to parse aborts the sync before anything is written.

use super::object::{ObjectStore, SharedStore};
use super::secrets::{MemorySecretStore, SecretData};
use crate::api::{ConfigRequest, ConfigRequestSpec, ObjectKey, ObjectMeta};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const CA_KEY: &str = "ca.crt";

/// Secret manifest type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretType {
    Tls,
    #[default]
    Opaque,
}

/// One manifest document.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    ConfigRequest {
        metadata: ObjectMeta,
        spec: ConfigRequestSpec,
    },
    Secret {
        metadata: ObjectMeta,
        #[serde(rename = "type", default)]
        secret_type: SecretType,
        #[serde(default)]
        data: BTreeMap<String, String>,
    },
}

impl Manifest {
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::ConfigRequest { metadata, .. } | Self::Secret { metadata, .. } => metadata.key(),
        }
    }
}

/// Convert secret manifest data to secret material.
pub fn secret_data(
    key: &ObjectKey,
    secret_type: SecretType,
    data: &BTreeMap<String, String>,
) -> Result<SecretData> {
    match secret_type {
        SecretType::Opaque => Ok(SecretData::Opaque(data.clone())),
        SecretType::Tls => {
            let field = |name: &str| {
                data.get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("tls secret {} is missing {}", key, name))
            };
            Ok(SecretData::Tls {
                certificate: field(TLS_CERT_KEY)?,
                private_key: field(TLS_KEY_KEY)?,
                ca: data.get(CA_KEY).cloned(),
            })
        }
    }
}

/// Parse every document in a manifest file.
pub fn parse_file(path: &Path) -> Result<Vec<Manifest>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    parse_documents(&text, path)
}

fn parse_documents(text: &str, path: &Path) -> Result<Vec<Manifest>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let value: serde_json::Value = serde_json::from_str(text)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            let docs = match value {
                serde_json::Value::Array(items) => items,
                other => vec![other],
            };
            docs.into_iter()
                .map(|doc| {
                    serde_json::from_value(doc)
                        .with_context(|| format!("invalid manifest in {}", path.display()))
                })
                .collect()
        }
        Some("yaml") | Some("yml") => {
            let mut manifests = Vec::new();
            for doc in serde_yaml::Deserializer::from_str(text) {
                let value = serde_yaml::Value::deserialize(doc)
                    .with_context(|| format!("invalid YAML in {}", path.display()))?;
                if value.is_null() {
                    continue;
                }
                manifests.push(
                    serde_yaml::from_value(value)
                        .with_context(|| format!("invalid manifest in {}", path.display()))?,
                );
            }
            Ok(manifests)
        }
        _ => bail!("unsupported manifest extension: {}", path.display()),
    }
}

/// Manifest files in a directory, sorted by name.
pub fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read manifest directory {}", dir.display()))?
    {
        let path = entry?.path();
        let supported = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json" | "yaml" | "yml")
        );
        if supported && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Outcome of one sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

#[derive(Debug, Default)]
struct Loaded {
    requests: BTreeSet<ObjectKey>,
    secrets: BTreeSet<ObjectKey>,
}

/// Keeps the request and secret stores in line with a manifest directory.
pub struct ManifestLoader {
    dir: PathBuf,
    requests: SharedStore<ConfigRequest>,
    secrets: Arc<MemorySecretStore>,
    loaded: Mutex<Loaded>,
}

impl ManifestLoader {
    pub fn new(
        dir: impl Into<PathBuf>,
        requests: SharedStore<ConfigRequest>,
        secrets: Arc<MemorySecretStore>,
    ) -> Self {
        Self {
            dir: dir.into(),
            requests,
            secrets,
            loaded: Mutex::new(Loaded::default()),
        }
    }

    /// Read the directory and apply it.
    pub async fn sync(&self) -> Result<SyncSummary> {
        let mut manifests = Vec::new();
        for path in manifest_files(&self.dir)? {
            manifests.extend(parse_file(&path)?);
        }

        let mut summary = SyncSummary::default();
        let mut seen = Loaded::default();

        for manifest in manifests {
            let key = manifest.key();
            match manifest {
                Manifest::ConfigRequest { metadata, spec } => {
                    if !seen.requests.insert(key.clone()) {
                        bail!("duplicate ConfigRequest manifest {}", key);
                    }
                    self.apply_request(metadata, spec, &mut summary).await?;
                }
                Manifest::Secret {
                    secret_type, data, ..
                } => {
                    if !seen.secrets.insert(key.clone()) {
                        bail!("duplicate Secret manifest {}", key);
                    }
                    self.secrets
                        .put(key.clone(), secret_data(&key, secret_type, &data)?);
                }
            }
        }

        let previous = std::mem::take(&mut *self.loaded.lock());
        for key in previous.requests.difference(&seen.requests) {
            match self.requests.delete(key).await {
                Ok(()) => {
                    tracing::info!(request = %key, "manifest removed, deleting ConfigRequest");
                    summary.deleted += 1;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        for key in previous.secrets.difference(&seen.secrets) {
            if self.secrets.remove(key) {
                summary.deleted += 1;
            }
        }
        *self.loaded.lock() = seen;

        Ok(summary)
    }

    async fn apply_request(
        &self,
        metadata: ObjectMeta,
        spec: ConfigRequestSpec,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let key = metadata.key();
        match self.requests.get(&key).await {
            Ok(mut stored) => {
                if stored.spec == spec && stored.metadata.labels == metadata.labels {
                    summary.unchanged += 1;
                    return Ok(());
                }
                stored.spec = spec;
                stored.metadata.labels = metadata.labels;
                self.requests.update(stored).await?;
                tracing::info!(request = %key, "ConfigRequest updated from manifest");
                summary.updated += 1;
            }
            Err(err) if err.is_not_found() => {
                let mut meta = ObjectMeta::new(metadata.namespace, metadata.name);
                meta.labels = metadata.labels;
                self.requests.create(ConfigRequest::new(meta, spec)).await?;
                tracing::info!(request = %key, "ConfigRequest created from manifest");
                summary.created += 1;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Sync now, then every `interval` until shutdown. A zero interval syncs once.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.sync().await {
                Ok(summary) => tracing::debug!(
                    dir = %self.dir.display(),
                    created = summary.created,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    "manifest sync complete"
                ),
                Err(err) => tracing::warn!(
                    dir = %self.dir.display(),
                    error = %format!("{:#}", err),
                    "manifest sync failed"
                ),
            }
            if interval.is_zero() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ResourceType, SerializationFormat};

    #[test]
    fn yaml_multi_document() {
        let text = r#"
kind: ConfigRequest
metadata:
  name: edge
spec:
  nodeID: edge-1
  serialization: yaml
  resources:
    - type: cluster
      value: "name: backend"
---
kind: Secret
metadata:
  name: cert
  namespace: prod
type: tls
data:
  tls.crt: CERT
  tls.key: KEY
"#;
        let docs = parse_documents(text, Path::new("m.yaml")).unwrap();
        assert_eq!(docs.len(), 2);
        match &docs[0] {
            Manifest::ConfigRequest { metadata, spec } => {
                assert_eq!(metadata.namespace, "default");
                assert_eq!(spec.serialization, SerializationFormat::Yaml);
                let entries = spec.resources.as_ref().unwrap();
                assert_eq!(entries[0].resource_type, ResourceType::Cluster);
            }
            other => panic!("unexpected manifest {:?}", other),
        }
        match &docs[1] {
            Manifest::Secret {
                metadata,
                secret_type,
                data,
            } => {
                let key = metadata.key();
                assert_eq!(key, ObjectKey::new("prod", "cert"));
                assert_eq!(
                    secret_data(&key, *secret_type, data).unwrap(),
                    SecretData::tls("CERT", "KEY")
                );
            }
            other => panic!("unexpected manifest {:?}", other),
        }
    }

    #[test]
    fn json_array() {
        let text = r#"[
            {"kind":"Secret","metadata":{"name":"a"},"data":{"token":"t"}},
            {"kind":"Secret","metadata":{"name":"b"},"type":"opaque"}
        ]"#;
        let docs = parse_documents(text, Path::new("m.json")).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].key(), ObjectKey::new("default", "b"));
    }

    #[test]
    fn tls_secret_requires_key() {
        let key = ObjectKey::new("default", "cert");
        let data: BTreeMap<String, String> =
            [("tls.crt".to_string(), "CERT".to_string())].into_iter().collect();
        assert!(secret_data(&key, SecretType::Tls, &data).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let text = r#"{"kind":"Pod","metadata":{"name":"a"}}"#;
        assert!(parse_documents(text, Path::new("m.json")).is_err());
    }
}
