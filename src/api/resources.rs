//! Resource declarations carried by config requests and revisions.
//!
//! A declaration is either a raw value in the request's serialization format
//! or a generator that builds a `secret` resource from stored secret material.
//! The legacy per-type layout is normalized into the same ordered list.

use crate::core::error::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};

/// Discovery protocol API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ApiVersion {
    #[default]
    #[serde(rename = "v3")]
    V3,
}

impl ApiVersion {
    /// Label / wire form.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V3 => "v3",
        }
    }

    /// Type URL served for a resource type under this API version.
    pub const fn type_url(&self, resource_type: ResourceType) -> &'static str {
        match (self, resource_type) {
            (Self::V3, ResourceType::Endpoint) => {
                "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"
            }
            (Self::V3, ResourceType::Cluster) => {
                "type.googleapis.com/envoy.config.cluster.v3.Cluster"
            }
            (Self::V3, ResourceType::Route) => {
                "type.googleapis.com/envoy.config.route.v3.RouteConfiguration"
            }
            (Self::V3, ResourceType::ScopedRoute) => {
                "type.googleapis.com/envoy.config.route.v3.ScopedRouteConfiguration"
            }
            (Self::V3, ResourceType::Listener) => {
                "type.googleapis.com/envoy.config.listener.v3.Listener"
            }
            (Self::V3, ResourceType::Secret) => {
                "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret"
            }
            (Self::V3, ResourceType::Runtime) => {
                "type.googleapis.com/envoy.service.runtime.v3.Runtime"
            }
            (Self::V3, ResourceType::ExtensionConfig) => {
                "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig"
            }
        }
    }

    /// Resolve a type URL back to a resource type.
    pub fn resource_type_for(&self, type_url: &str) -> Option<ResourceType> {
        ResourceType::ALL
            .into_iter()
            .find(|t| self.type_url(*t) == type_url)
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApiVersion {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v3" => Ok(Self::V3),
            other => Err(TesseraError::invalid(format!(
                "unsupported api version: {}",
                other
            ))),
        }
    }
}

/// Serialization format of raw resource values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Json,
    B64Json,
    Yaml,
}

impl SerializationFormat {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::B64Json => "b64json",
            Self::Yaml => "yaml",
        }
    }
}

impl std::fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The eight resource classes served over the discovery protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    Endpoint,
    Cluster,
    Route,
    ScopedRoute,
    Listener,
    Secret,
    Runtime,
    ExtensionConfig,
}

impl ResourceType {
    /// Every resource type, in snapshot slot order.
    pub const ALL: [ResourceType; 8] = [
        Self::Endpoint,
        Self::Cluster,
        Self::Route,
        Self::ScopedRoute,
        Self::Listener,
        Self::Secret,
        Self::Runtime,
        Self::ExtensionConfig,
    ];

    /// Declaration name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint",
            Self::Cluster => "cluster",
            Self::Route => "route",
            Self::ScopedRoute => "scopedRoute",
            Self::Listener => "listener",
            Self::Secret => "secret",
            Self::Runtime => "runtime",
            Self::ExtensionConfig => "extensionConfig",
        }
    }

    /// Slot position inside a snapshot.
    pub const fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a `secret` generated from a TLS secret should contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Blueprint {
    /// Certificate chain and private key.
    #[default]
    TlsCertificate,
    /// Trusted CA bundle.
    ValidationContext,
}

/// Reference to a TLS secret used as a generator source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecretRef {
    /// Secret name in the request's namespace; also the served resource name.
    pub name: String,
    #[serde(default)]
    pub blueprint: Blueprint,
}

/// Reference to one key of an opaque secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpaqueSecretRef {
    pub name: String,
    pub key: String,
    /// Served resource name; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Where the content of a resource declaration comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceSource {
    /// Raw text in the declared serialization format.
    Value(String),
    /// Generated from a TLS secret.
    GenerateFromTlsSecret(TlsSecretRef),
    /// Generated from a key of an opaque secret.
    GenerateFromOpaqueSecret(OpaqueSecretRef),
}

impl ResourceSource {
    /// Whether the source needs the secret store.
    pub fn is_generator(&self) -> bool {
        !matches!(self, Self::Value(_))
    }
}

/// One entry of the ordered resource list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceEntry {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    #[serde(flatten)]
    pub source: ResourceSource,
}

impl ResourceEntry {
    /// Raw-value entry.
    pub fn value(resource_type: ResourceType, raw: impl Into<String>) -> Self {
        Self {
            resource_type,
            source: ResourceSource::Value(raw.into()),
        }
    }

    /// TLS-secret generated entry.
    pub fn tls_secret(name: impl Into<String>, blueprint: Blueprint) -> Self {
        Self {
            resource_type: ResourceType::Secret,
            source: ResourceSource::GenerateFromTlsSecret(TlsSecretRef {
                name: name.into(),
                blueprint,
            }),
        }
    }

    /// Generators only produce `secret` resources.
    pub fn validate(&self, index: usize) -> TesseraResult<()> {
        if self.source.is_generator() && self.resource_type != ResourceType::Secret {
            return Err(TesseraError::Validation {
                index,
                resource_type: self.resource_type.to_string(),
                field: None,
                message: "secret generators are only valid for type secret".to_string(),
            });
        }
        Ok(())
    }
}

/// A named raw value in the legacy per-type layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEntry {
    pub name: String,
    pub value: String,
}

/// A secret in the legacy layout, pointing at a TLS secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySecret {
    pub name: String,
    /// Secret to read; defaults to `name`.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// Legacy per-type resource declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyResources {
    #[serde(default)]
    pub endpoints: Vec<LegacyEntry>,
    #[serde(default)]
    pub clusters: Vec<LegacyEntry>,
    #[serde(default)]
    pub routes: Vec<LegacyEntry>,
    #[serde(default)]
    pub scoped_routes: Vec<LegacyEntry>,
    #[serde(default)]
    pub listeners: Vec<LegacyEntry>,
    #[serde(default)]
    pub runtimes: Vec<LegacyEntry>,
    #[serde(default)]
    pub extension_configs: Vec<LegacyEntry>,
    #[serde(default)]
    pub secrets: Vec<LegacySecret>,
}

impl LegacyResources {
    /// Flatten into the ordered resource list.
    pub fn to_entries(&self) -> Vec<ResourceEntry> {
        let raw = [
            (ResourceType::Endpoint, &self.endpoints),
            (ResourceType::Cluster, &self.clusters),
            (ResourceType::Route, &self.routes),
            (ResourceType::ScopedRoute, &self.scoped_routes),
            (ResourceType::Listener, &self.listeners),
            (ResourceType::Runtime, &self.runtimes),
            (ResourceType::ExtensionConfig, &self.extension_configs),
        ];

        let mut entries: Vec<ResourceEntry> = raw
            .into_iter()
            .flat_map(|(t, list)| {
                list.iter()
                    .map(move |entry| ResourceEntry::value(t, entry.value.clone()))
            })
            .collect();

        entries.extend(self.secrets.iter().map(|secret| {
            ResourceEntry::tls_secret(
                secret.secret_ref.clone().unwrap_or_else(|| secret.name.clone()),
                Blueprint::TlsCertificate,
            )
        }));
        entries
    }
}
