//! ConfigRevision: one immutable content version for a node.

use super::conditions::{ConditionType, Conditions};
use super::meta::{ObjectKey, ObjectMeta, LABEL_API_VERSION, LABEL_NODE_ID, LABEL_VERSION};
use super::resources::{ApiVersion, ResourceEntry, SerializationFormat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable payload of a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRevisionSpec {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub api_version: ApiVersion,
    /// Content hash of `resources`.
    pub version: String,
    pub serialization: SerializationFormat,
    pub resources: Vec<ResourceEntry>,
}

/// Mutable status of a revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRevisionStatus {
    #[serde(default)]
    pub published: bool,

    #[serde(default)]
    pub tainted: bool,

    /// Set only on the transition to published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_published_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Conditions,
}

/// A content-addressed revision of a node's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRevision {
    pub metadata: ObjectMeta,
    pub spec: ConfigRevisionSpec,
    #[serde(default)]
    pub status: ConfigRevisionStatus,
}

impl ConfigRevision {
    /// Build a labeled revision owned by `owner`.
    pub fn new(namespace: &str, spec: ConfigRevisionSpec, owner: Option<ObjectKey>) -> Self {
        let mut metadata = ObjectMeta::new(namespace, revision_name(&spec.node_id, &spec.version));
        metadata.labels = revision_labels(&spec.node_id, &spec.version, spec.api_version);
        metadata.owner = owner;
        Self {
            metadata,
            spec,
            status: ConfigRevisionStatus::default(),
        }
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    pub fn is_published(&self) -> bool {
        self.status.conditions.is_true(ConditionType::RevisionPublished)
    }

    pub fn is_tainted(&self) -> bool {
        self.status.conditions.is_true(ConditionType::RevisionTainted)
    }

    /// Time of last activity: last publication, else creation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.status
            .last_published_at
            .unwrap_or_else(|| self.metadata.created_at())
    }

    /// Labels this revision is expected to carry.
    pub fn expected_labels(&self) -> BTreeMap<String, String> {
        revision_labels(&self.spec.node_id, &self.spec.version, self.spec.api_version)
    }
}

/// The three lookup labels of a revision.
pub fn revision_labels(
    node_id: &str,
    version: &str,
    api_version: ApiVersion,
) -> BTreeMap<String, String> {
    [
        (LABEL_NODE_ID.to_string(), node_id.to_string()),
        (LABEL_VERSION.to_string(), version.to_string()),
        (LABEL_API_VERSION.to_string(), api_version.to_string()),
    ]
    .into_iter()
    .collect()
}

/// Object name of the revision holding `version` for `node_id`.
pub fn revision_name(node_id: &str, version: &str) -> String {
    let node: String = node_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", node, version)
}
