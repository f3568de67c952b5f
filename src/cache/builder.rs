//! Cache Builder.
//!
//! Turns a published revision into a snapshot: decode every raw entry,
//! generate secrets from stored material, group by type, hash each slot and
//! replace the node's cache entry only when something changed.
//!
//! Errors carry their category in the type. [`CacheError::Validation`] is a
//! property of the revision content and never goes away on retry;
//! [`CacheError::Secret`] depends on external state and does.

use super::decode::DecoderRegistry;
use super::resource::{DecodeError, Resource, Secret};
use super::snapshot::{RevisionTag, Snapshot, VersionTracker};
use super::snapshot_cache::SnapshotCache;
use crate::api::{
    ConfigRevision, ObjectKey, OpaqueSecretRef, ResourceEntry, ResourceSource, ResourceType,
    TlsSecretRef,
};
use crate::core::error::TesseraError;
use crate::store::secrets::{SecretData, SecretError, SharedSecretStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Build failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Permanent: the content does not decode.
    #[error("resource {index} ({resource_type}){}: {message}", field_suffix(.field))]
    Validation {
        index: usize,
        resource_type: ResourceType,
        field: Option<String>,
        message: String,
    },

    /// Transient: referenced secret material is unavailable.
    #[error("resource {index}: {source}")]
    Secret { index: usize, source: SecretError },
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(field) => format!(" field {}", field),
        None => String::new(),
    }
}

impl CacheError {
    fn validation(index: usize, resource_type: ResourceType, err: DecodeError) -> Self {
        Self::Validation {
            index,
            resource_type,
            field: err.field,
            message: err.message,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<CacheError> for TesseraError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Validation {
                index,
                resource_type,
                field,
                message,
            } => TesseraError::Validation {
                index,
                resource_type: resource_type.to_string(),
                field,
                message,
            },
            CacheError::Secret { source, .. } => {
                let key = match &source {
                    SecretError::NotFound(key)
                    | SecretError::WrongType { key, .. }
                    | SecretError::MissingKey { key, .. } => key.to_string(),
                };
                TesseraError::SecretUnavailable {
                    key,
                    reason: source.to_string(),
                }
            }
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Per-type content versions of the built snapshot.
    pub versions: VersionTracker,
    /// Whether the snapshot cache was written.
    pub updated: bool,
}

/// Builds snapshots from revisions and publishes them to the cache.
#[derive(Clone)]
pub struct CacheBuilder {
    cache: Arc<SnapshotCache>,
    secrets: SharedSecretStore,
    decoders: DecoderRegistry,
}

impl CacheBuilder {
    pub fn new(cache: Arc<SnapshotCache>, secrets: SharedSecretStore) -> Self {
        Self::with_decoders(cache, secrets, DecoderRegistry::default())
    }

    pub fn with_decoders(
        cache: Arc<SnapshotCache>,
        secrets: SharedSecretStore,
        decoders: DecoderRegistry,
    ) -> Self {
        Self {
            cache,
            secrets,
            decoders,
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Decode a revision into a snapshot without touching the cache.
    ///
    /// A content error anywhere wins over a secret error, so a revision
    /// that can never build is reported as such even while a secret is
    /// missing.
    pub async fn snapshot_for(&self, revision: &ConfigRevision) -> Result<Snapshot, CacheError> {
        let spec = &revision.spec;
        let mut slots: BTreeMap<ResourceType, BTreeMap<String, Resource>> = BTreeMap::new();
        let mut secret_error = None;

        for (index, entry) in spec.resources.iter().enumerate() {
            let resource = match self
                .resolve(index, entry, &revision.metadata.namespace, spec.serialization)
                .await
            {
                Ok(resource) => resource,
                Err(err @ CacheError::Secret { .. }) => {
                    secret_error.get_or_insert(err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let slot = slots.entry(entry.resource_type).or_default();
            let name = resource.name().to_string();
            if slot.contains_key(&name) {
                let field = match entry.resource_type {
                    ResourceType::Endpoint => "cluster_name",
                    _ => "name",
                };
                return Err(CacheError::Validation {
                    index,
                    resource_type: entry.resource_type,
                    field: Some(field.to_string()),
                    message: format!("duplicate name {}", name),
                });
            }
            slot.insert(name, resource);
        }

        if let Some(err) = secret_error {
            return Err(err);
        }

        Ok(Snapshot::new(
            spec.node_id.clone(),
            spec.api_version,
            RevisionTag {
                key: revision.metadata.key(),
                version: spec.version.clone(),
            },
            slots,
        ))
    }

    /// Build a revision and publish it if it differs from what is served.
    pub async fn build(&self, revision: &ConfigRevision) -> Result<BuildOutcome, CacheError> {
        let snapshot = self.snapshot_for(revision).await?;
        Ok(self.publish(snapshot))
    }

    /// Swap a built snapshot in unless the node already serves the same
    /// revision and content.
    pub fn publish(&self, snapshot: Snapshot) -> BuildOutcome {
        let versions = snapshot.versions();

        let unchanged = self.cache.get(&snapshot.node_id).is_some_and(|current| {
            current.revision == snapshot.revision && current.same_content(&snapshot)
        });
        if unchanged {
            return BuildOutcome {
                versions,
                updated: false,
            };
        }

        tracing::info!(
            node_id = %snapshot.node_id,
            revision = %snapshot.revision.key,
            resources = snapshot.resource_count(),
            "publishing snapshot"
        );
        self.cache.set(snapshot);
        BuildOutcome {
            versions,
            updated: true,
        }
    }

    async fn resolve(
        &self,
        index: usize,
        entry: &ResourceEntry,
        namespace: &str,
        format: crate::api::SerializationFormat,
    ) -> Result<Resource, CacheError> {
        let resource_type = entry.resource_type;
        if entry.source.is_generator() && resource_type != ResourceType::Secret {
            return Err(CacheError::Validation {
                index,
                resource_type,
                field: None,
                message: "secret generators are only valid for type secret".to_string(),
            });
        }

        match &entry.source {
            ResourceSource::Value(raw) => {
                let value = self.decoders.decode(format, raw).map_err(|message| {
                    CacheError::Validation {
                        index,
                        resource_type,
                        field: None,
                        message,
                    }
                })?;
                Resource::decode(resource_type, value)
                    .map_err(|err| CacheError::validation(index, resource_type, err))
            }
            ResourceSource::GenerateFromTlsSecret(reference) => {
                self.tls_secret(index, namespace, reference).await
            }
            ResourceSource::GenerateFromOpaqueSecret(reference) => {
                self.opaque_secret(index, namespace, reference).await
            }
        }
    }

    async fn tls_secret(
        &self,
        index: usize,
        namespace: &str,
        reference: &TlsSecretRef,
    ) -> Result<Resource, CacheError> {
        let key = ObjectKey::new(namespace, reference.name.clone());
        match self.fetch(index, &key).await? {
            SecretData::Tls {
                certificate,
                private_key,
                ca,
            } => Ok(Resource::Secret(Secret::from_tls(
                &reference.name,
                reference.blueprint,
                &certificate,
                &private_key,
                ca.as_deref(),
            ))),
            other => Err(CacheError::Secret {
                index,
                source: SecretError::WrongType {
                    key,
                    expected: "tls",
                    found: other.type_name(),
                },
            }),
        }
    }

    async fn opaque_secret(
        &self,
        index: usize,
        namespace: &str,
        reference: &OpaqueSecretRef,
    ) -> Result<Resource, CacheError> {
        let key = ObjectKey::new(namespace, reference.name.clone());
        let data = match self.fetch(index, &key).await? {
            SecretData::Opaque(data) => data,
            other => {
                return Err(CacheError::Secret {
                    index,
                    source: SecretError::WrongType {
                        key,
                        expected: "opaque",
                        found: other.type_name(),
                    },
                })
            }
        };
        let Some(value) = data.get(&reference.key) else {
            return Err(CacheError::Secret {
                index,
                source: SecretError::MissingKey {
                    key,
                    field: reference.key.clone(),
                },
            });
        };
        let name = reference.alias.as_deref().unwrap_or(&reference.name);
        Ok(Resource::Secret(Secret::generic(name, value)))
    }

    async fn fetch(&self, index: usize, key: &ObjectKey) -> Result<SecretData, CacheError> {
        self.secrets
            .get_secret(key)
            .await
            .map_err(|source| CacheError::Secret { index, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiVersion, Blueprint, ConfigRevisionSpec, SerializationFormat};
    use crate::store::secrets::MemorySecretStore;

    fn revision(resources: Vec<ResourceEntry>) -> ConfigRevision {
        ConfigRevision::new(
            "default",
            ConfigRevisionSpec {
                node_id: "n1".into(),
                api_version: ApiVersion::V3,
                version: "v1".into(),
                serialization: SerializationFormat::Json,
                resources,
            },
            None,
        )
    }

    fn builder() -> (CacheBuilder, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        (
            CacheBuilder::new(Arc::new(SnapshotCache::new()), secrets.clone()),
            secrets,
        )
    }

    #[tokio::test]
    async fn unchanged_rebuild_does_not_write() {
        let (builder, _) = builder();
        let rev = revision(vec![ResourceEntry::value(
            ResourceType::Cluster,
            r#"{"name":"c"}"#,
        )]);

        assert!(builder.build(&rev).await.unwrap().updated);
        let again = builder.build(&rev).await.unwrap();
        assert!(!again.updated);
        assert_eq!(builder.cache().write_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_names_are_permanent() {
        let (builder, _) = builder();
        let rev = revision(vec![
            ResourceEntry::value(ResourceType::Cluster, r#"{"name":"c"}"#),
            ResourceEntry::value(ResourceType::Cluster, r#"{"name":"c","connect_timeout":"1s"}"#),
        ]);
        let err = builder.build(&rev).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(matches!(err, CacheError::Validation { index: 1, .. }));
        assert_eq!(builder.cache().write_count(), 0);
    }

    #[tokio::test]
    async fn missing_secret_is_transient() {
        let (builder, secrets) = builder();
        let rev = revision(vec![ResourceEntry::tls_secret("cert", Blueprint::TlsCertificate)]);

        let err = builder.build(&rev).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(TesseraError::from(err).is_retriable());

        secrets.put(
            ObjectKey::new("default", "cert"),
            SecretData::tls("CERT", "KEY"),
        );
        builder.build(&rev).await.unwrap();
        let snapshot = builder.cache().get("n1").unwrap();
        assert!(snapshot.slot(ResourceType::Secret).resources.contains_key("cert"));
    }

    #[tokio::test]
    async fn content_error_wins_over_secret_error() {
        let (builder, _) = builder();
        let rev = revision(vec![
            ResourceEntry::tls_secret("cert", Blueprint::TlsCertificate),
            ResourceEntry::value(ResourceType::Listener, r#"{"name":""}"#),
        ]);
        let err = builder.build(&rev).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn opaque_secret_with_alias() {
        let (builder, secrets) = builder();
        secrets.put(
            ObjectKey::new("default", "tokens"),
            SecretData::Opaque([("api".to_string(), "s3cr3t".to_string())].into_iter().collect()),
        );
        let rev = revision(vec![ResourceEntry {
            resource_type: ResourceType::Secret,
            source: ResourceSource::GenerateFromOpaqueSecret(OpaqueSecretRef {
                name: "tokens".into(),
                key: "api".into(),
                alias: Some("api-token".into()),
            }),
        }]);
        builder.build(&rev).await.unwrap();
        let snapshot = builder.cache().get("n1").unwrap();
        assert!(snapshot
            .slot(ResourceType::Secret)
            .resources
            .contains_key("api-token"));
    }
}
