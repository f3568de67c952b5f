//! Snapshot Cache.
//!
//! Node id → current snapshot. Each node has its own `watch` channel holding
//! an `Arc<Snapshot>`; a write replaces the whole `Arc`, so a reader sees the
//! old or the new snapshot and never a mix. The node map lock is held only
//! to find or insert a channel, so writers for one node do not block readers
//! of another. A node with no snapshot and no subscribers is forgotten, so
//! client-supplied node ids do not accumulate.

use super::snapshot::Snapshot;
use crate::api::ObjectKey;
use crate::ops::observability::SharedMetrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Receiver side of a node's snapshot channel.
pub type SnapshotReceiver = watch::Receiver<Option<Arc<Snapshot>>>;

#[derive(Debug)]
struct NodeEntry {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
}

/// Thread-safe per-node snapshot map.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    nodes: RwLock<HashMap<String, NodeEntry>>,
    writes: AtomicU64,
    metrics: Option<SharedMetrics>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: SharedMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    /// Run `f` on a node's entry, creating it if needed. Sends happen under
    /// the map lock so `release` cannot drop an entry mid-write.
    fn with_entry<R>(&self, node_id: &str, f: impl Fn(&NodeEntry) -> R) -> R {
        if let Some(entry) = self.nodes.read().get(node_id) {
            return f(entry);
        }
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node_id.to_string()).or_insert_with(|| {
            let (tx, _) = watch::channel(None);
            NodeEntry { tx }
        });
        f(entry)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot_write();
        }
    }

    /// Current snapshot of a node.
    pub fn get(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.nodes
            .read()
            .get(node_id)
            .and_then(|entry| entry.tx.borrow().clone())
    }

    /// Replace a node's snapshot and wake its subscribers.
    pub fn set(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.with_entry(&snapshot.node_id, |entry| {
            entry.tx.send_replace(Some(snapshot.clone()));
        });
        self.record_write();
        tracing::debug!(
            node_id = %snapshot.node_id,
            revision = %snapshot.revision.key,
            version = %snapshot.revision.version,
            "snapshot updated"
        );
        snapshot
    }

    /// Drop a node's snapshot. Returns true if one was present.
    pub fn clear(&self, node_id: &str) -> bool {
        let had_snapshot = match self.nodes.read().get(node_id) {
            Some(entry) if entry.tx.borrow().is_some() => {
                entry.tx.send_replace(None);
                true
            }
            _ => false,
        };
        if had_snapshot {
            self.record_write();
            tracing::debug!(node_id = %node_id, "snapshot cleared");
        }
        self.release(node_id);
        had_snapshot
    }

    /// Forget a node that has no snapshot and no subscribers.
    ///
    /// Returns true if the node was removed.
    pub fn release(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write();
        let idle = nodes
            .get(node_id)
            .is_some_and(|entry| entry.tx.borrow().is_none() && entry.tx.receiver_count() == 0);
        if idle {
            nodes.remove(node_id);
        }
        idle
    }

    /// Drop every snapshot built from the given revision.
    pub fn remove_by_revision(&self, revision: &ObjectKey) -> Vec<String> {
        let matching: Vec<String> = self
            .nodes
            .read()
            .iter()
            .filter(|(_, entry)| {
                entry
                    .tx
                    .borrow()
                    .as_ref()
                    .is_some_and(|s| &s.revision.key == revision)
            })
            .map(|(node, _)| node.clone())
            .collect();
        matching.into_iter().filter(|node| self.clear(node)).collect()
    }

    /// Subscribe to a node's snapshot, including nodes with none yet.
    pub fn subscribe(&self, node_id: &str) -> SnapshotReceiver {
        self.with_entry(node_id, |entry| entry.tx.subscribe())
    }

    /// Nodes with a snapshot, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .nodes
            .read()
            .iter()
            .filter(|(_, entry)| entry.tx.borrow().is_some())
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Nodes tracked, with or without a snapshot.
    pub fn tracked(&self) -> usize {
        self.nodes.read().len()
    }

    /// Number of snapshot replacements and clears.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiVersion;
    use crate::cache::snapshot::RevisionTag;
    use std::collections::BTreeMap;

    fn snapshot(node: &str, revision: &str) -> Snapshot {
        Snapshot::new(
            node,
            ApiVersion::V3,
            RevisionTag {
                key: ObjectKey::new("default", revision),
                version: revision.into(),
            },
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn subscribers_see_replacements() {
        let cache = SnapshotCache::new();
        let mut rx = cache.subscribe("n1");
        assert!(rx.borrow().is_none());

        cache.set(snapshot("n1", "r1"));
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().as_ref().unwrap().revision.version,
            "r1"
        );
        assert!(cache.get("n2").is_none());
        assert_eq!(cache.nodes(), vec!["n1".to_string()]);
    }

    #[test]
    fn remove_by_revision_only_clears_matching_nodes() {
        let cache = SnapshotCache::new();
        cache.set(snapshot("n1", "r1"));
        cache.set(snapshot("n2", "r2"));

        let cleared = cache.remove_by_revision(&ObjectKey::new("default", "r1"));
        assert_eq!(cleared, vec!["n1".to_string()]);
        assert!(cache.get("n1").is_none());
        assert!(cache.get("n2").is_some());
        assert_eq!(cache.write_count(), 3);

        assert!(!cache.clear("n1"));
        assert_eq!(cache.write_count(), 3);
    }

    #[test]
    fn idle_nodes_are_forgotten() {
        let cache = SnapshotCache::new();
        for i in 0..1000 {
            let node = format!("client-{}", i);
            drop(cache.subscribe(&node));
            assert!(cache.release(&node));
        }
        assert_eq!(cache.tracked(), 0);

        // A subscriber keeps the node; so does a snapshot.
        let rx = cache.subscribe("n1");
        cache.set(snapshot("n1", "r1"));
        assert!(cache.clear("n1"));
        assert_eq!(cache.tracked(), 1);
        drop(rx);
        assert!(cache.release("n1"));

        cache.set(snapshot("n2", "r2"));
        assert!(!cache.release("n2"));
        assert!(cache.clear("n2"));
        assert_eq!(cache.tracked(), 0);
    }
}
