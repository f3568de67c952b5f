//! Snapshots.
//!
//! A snapshot is the full served state for one node: one slot per resource
//! type, each with its resources keyed by name and a content version that
//! is a pure function of the slot's contents.

use super::hash::content_hash;
use super::resource::Resource;
use crate::api::{ApiVersion, ObjectKey, ResourceType};
use serde::Serialize;
use std::collections::BTreeMap;

/// The revision a snapshot was built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionTag {
    pub key: ObjectKey,
    pub version: String,
}

/// Resources of one type.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub version: String,
    pub resources: BTreeMap<String, Resource>,
}

impl Slot {
    pub fn new(resources: BTreeMap<String, Resource>) -> Self {
        let canonical: Vec<(&str, serde_json::Value)> = resources
            .iter()
            .map(|(name, resource)| (name.as_str(), resource.to_value()))
            .collect();
        Self {
            version: content_hash(&canonical),
            resources,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Resources restricted to `names`; all of them when `names` is empty.
    pub fn select<'a>(&'a self, names: &[String]) -> Vec<&'a Resource> {
        if names.is_empty() {
            return self.resources.values().collect();
        }
        names
            .iter()
            .filter_map(|name| self.resources.get(name))
            .collect()
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

/// Per-type content versions of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionTracker {
    versions: BTreeMap<ResourceType, String>,
}

impl VersionTracker {
    pub fn get(&self, resource_type: ResourceType) -> Option<&str> {
        self.versions.get(&resource_type).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &str)> {
        self.versions.iter().map(|(t, v)| (*t, v.as_str()))
    }

    /// Types whose version differs from `other`.
    pub fn changed_since(&self, other: &VersionTracker) -> Vec<ResourceType> {
        ResourceType::ALL
            .into_iter()
            .filter(|t| self.get(*t) != other.get(*t))
            .collect()
    }
}

/// Served state for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub node_id: String,
    pub api_version: ApiVersion,
    pub revision: RevisionTag,
    slots: [Slot; 8],
}

impl Snapshot {
    pub fn new(
        node_id: impl Into<String>,
        api_version: ApiVersion,
        revision: RevisionTag,
        mut resources: BTreeMap<ResourceType, BTreeMap<String, Resource>>,
    ) -> Self {
        let slots = std::array::from_fn(|i| {
            Slot::new(resources.remove(&ResourceType::ALL[i]).unwrap_or_default())
        });
        Self {
            node_id: node_id.into(),
            api_version,
            revision,
            slots,
        }
    }

    pub fn slot(&self, resource_type: ResourceType) -> &Slot {
        &self.slots[resource_type.index()]
    }

    pub fn versions(&self) -> VersionTracker {
        VersionTracker {
            versions: ResourceType::ALL
                .into_iter()
                .map(|t| (t, self.slot(t).version.clone()))
                .collect(),
        }
    }

    /// True when every slot has the same content version as `other`.
    pub fn same_content(&self, other: &Snapshot) -> bool {
        self.slots
            .iter()
            .zip(other.slots.iter())
            .all(|(a, b)| a.version == b.version)
    }

    /// Total number of resources.
    pub fn resource_count(&self) -> usize {
        self.slots.iter().map(Slot::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster(name: &str) -> Resource {
        Resource::decode(ResourceType::Cluster, json!({ "name": name })).unwrap()
    }

    fn tag(version: &str) -> RevisionTag {
        RevisionTag {
            key: ObjectKey::new("default", format!("n1-{}", version)),
            version: version.into(),
        }
    }

    fn snapshot(version: &str, names: &[&str]) -> Snapshot {
        let clusters = names
            .iter()
            .map(|n| (n.to_string(), cluster(n)))
            .collect();
        Snapshot::new(
            "n1",
            ApiVersion::V3,
            tag(version),
            [(ResourceType::Cluster, clusters)].into_iter().collect(),
        )
    }

    #[test]
    fn slot_version_tracks_content_only() {
        let a = snapshot("v1", &["a", "b"]);
        let b = snapshot("v2", &["b", "a"]);
        assert!(a.same_content(&b));
        assert_eq!(a.versions(), b.versions());

        let c = snapshot("v3", &["a"]);
        assert!(!a.same_content(&c));
        assert_eq!(c.versions().changed_since(&a.versions()), vec![ResourceType::Cluster]);
    }

    #[test]
    fn empty_slots_share_a_version() {
        let s = snapshot("v1", &["a"]);
        assert_eq!(
            s.slot(ResourceType::Listener).version,
            s.slot(ResourceType::Route).version
        );
        assert_eq!(s.resource_count(), 1);
    }

    #[test]
    fn select_by_name() {
        let s = snapshot("v1", &["a", "b"]);
        let slot = s.slot(ResourceType::Cluster);
        assert_eq!(slot.select(&[]).len(), 2);
        let picked = slot.select(&["b".to_string(), "missing".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name(), "b");
    }
}
