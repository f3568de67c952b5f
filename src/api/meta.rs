//! Object metadata shared by every stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the node identity of a revision.
pub const LABEL_NODE_ID: &str = "tessera.io/node-id";
/// Label carrying the content version of a revision.
pub const LABEL_VERSION: &str = "tessera.io/version";
/// Label carrying the discovery API version of a revision.
pub const LABEL_API_VERSION: &str = "tessera.io/api-version";

/// Namespace used when a manifest does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespaced object identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata attached to every stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Controlling owner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ObjectKey>,

    /// Store-assigned version, bumped on every write.
    #[serde(default)]
    pub resource_version: u64,

    /// Store-assigned spec generation, bumped when the spec changes.
    #[serde(default)]
    pub generation: u64,

    /// Store-assigned creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ObjectMeta {
    /// Metadata for a record that has not been stored yet.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            owner: None,
            resource_version: 0,
            generation: 0,
            creation_timestamp: None,
        }
    }

    /// Key of the record.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Builder-style label insertion.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builder-style owner reference.
    pub fn with_owner(mut self, owner: ObjectKey) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Creation time, or the Unix epoch for records not yet stored.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.creation_timestamp
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector matching every object.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add a required label.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Check whether a label set satisfies this selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
    }

    /// True when the selector has no requirements.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
