//! ConfigRequest: desired configuration for one node and API version.

use super::conditions::Conditions;
use super::meta::{ObjectKey, ObjectMeta};
use super::resources::{ApiVersion, LegacyResources, ResourceEntry, SerializationFormat};
use crate::core::error::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};

/// Served state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    /// The desired revision is published.
    InSync,
    /// An older untainted revision is published instead of the desired one.
    Rollback,
    /// Every revision is tainted; nothing is published.
    RollbackFailed,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => f.write_str("InSync"),
            Self::Rollback => f.write_str("Rollback"),
            Self::RollbackFailed => f.write_str("RollbackFailed"),
        }
    }
}

/// Desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequestSpec {
    #[serde(rename = "nodeID")]
    pub node_id: String,

    #[serde(default)]
    pub api_version: ApiVersion,

    #[serde(default)]
    pub serialization: SerializationFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<ResourceEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_resources: Option<LegacyResources>,
}

impl ConfigRequestSpec {
    /// Spec with the ordered resource list set.
    pub fn new(node_id: impl Into<String>, resources: Vec<ResourceEntry>) -> Self {
        Self {
            node_id: node_id.into(),
            api_version: ApiVersion::default(),
            serialization: SerializationFormat::default(),
            resources: Some(resources),
            legacy_resources: None,
        }
    }

    /// Check the declaration invariants.
    pub fn validate(&self) -> TesseraResult<()> {
        if self.node_id.is_empty() {
            return Err(TesseraError::invalid("nodeID must not be empty"));
        }
        match (&self.resources, &self.legacy_resources) {
            (Some(_), Some(_)) => Err(TesseraError::invalid(
                "resources and legacyResources are mutually exclusive",
            )),
            (None, None) => Err(TesseraError::invalid(
                "one of resources or legacyResources must be set",
            )),
            (Some(entries), None) => entries
                .iter()
                .enumerate()
                .try_for_each(|(i, entry)| entry.validate(i)),
            (None, Some(_)) => Ok(()),
        }
    }

    /// The ordered resource list, whichever field declares it.
    pub fn normalized_resources(&self) -> Vec<ResourceEntry> {
        match (&self.resources, &self.legacy_resources) {
            (Some(entries), _) => entries.clone(),
            (None, Some(legacy)) => legacy.to_entries(),
            (None, None) => Vec::new(),
        }
    }
}

/// Pointer from a request's history to one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub version: String,
    pub revision: ObjectKey,
}

/// Observed state, owned by the request reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_state: Option<CacheState>,

    /// Revisions in publication-priority order, lowest first.
    #[serde(default)]
    pub revisions: Vec<RevisionRef>,

    #[serde(default)]
    pub conditions: Conditions,
}

/// Desired configuration for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub metadata: ObjectMeta,
    pub spec: ConfigRequestSpec,
    #[serde(default)]
    pub status: ConfigRequestStatus,
}

impl ConfigRequest {
    pub fn new(metadata: ObjectMeta, spec: ConfigRequestSpec) -> Self {
        Self {
            metadata,
            spec,
            status: ConfigRequestStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::resources::{LegacyEntry, ResourceType};

    #[test]
    fn exactly_one_declaration() {
        let mut spec = ConfigRequestSpec::new("n1", vec![]);
        assert!(spec.validate().is_ok());

        spec.legacy_resources = Some(LegacyResources::default());
        assert!(spec.validate().unwrap_err().is_permanent());

        spec.resources = None;
        assert!(spec.validate().is_ok());

        spec.legacy_resources = None;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn legacy_normalization() {
        let spec = ConfigRequestSpec {
            node_id: "n1".into(),
            api_version: ApiVersion::V3,
            serialization: SerializationFormat::Json,
            resources: None,
            legacy_resources: Some(LegacyResources {
                clusters: vec![LegacyEntry {
                    name: "c".into(),
                    value: r#"{"name":"c"}"#.into(),
                }],
                ..Default::default()
            }),
        };
        let entries = spec.normalized_resources();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_type, ResourceType::Cluster);
    }

    #[test]
    fn manifest_field_names() {
        let spec: ConfigRequestSpec = serde_json::from_str(
            r#"{"nodeID":"n1","serialization":"yaml","resources":[{"type":"cluster","value":"name: c"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.node_id, "n1");
        assert_eq!(spec.serialization, SerializationFormat::Yaml);
        assert_eq!(spec.api_version, ApiVersion::V3);
    }
}
