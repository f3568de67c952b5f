//! In-memory object store.
//!
//! Objects live in a primary map keyed by [`ObjectKey`]. A secondary index
//! maps every `(label, value)` pair to the ordered set of keys carrying it,
//! so a selector lookup is an intersection of index entries instead of a
//! scan. The index is updated under the same write lock as the primary map.

use super::object::{Object, ObjectStore, WatchEvent};
use crate::api::{LabelSelector, ObjectKey};
use crate::core::error::{TesseraError, TesseraResult};
use crate::core::time::{system_clock, SharedClock};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const WATCH_CAPACITY: usize = 1024;

/// Secondary index from label pairs to object keys.
#[derive(Debug, Default)]
struct LabelIndex {
    entries: HashMap<(String, String), BTreeSet<ObjectKey>>,
}

impl LabelIndex {
    fn insert(&mut self, key: &ObjectKey, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            self.entries
                .entry((k.clone(), v.clone()))
                .or_default()
                .insert(key.clone());
        }
    }

    fn remove(&mut self, key: &ObjectKey, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            let pair = (k.clone(), v.clone());
            if let Some(keys) = self.entries.get_mut(&pair) {
                keys.remove(key);
                if keys.is_empty() {
                    self.entries.remove(&pair);
                }
            }
        }
    }

    /// Keys matching every pair of a non-empty selector.
    fn lookup(&self, selector: &LabelSelector) -> BTreeSet<ObjectKey> {
        let mut sets: Vec<&BTreeSet<ObjectKey>> = Vec::with_capacity(selector.match_labels.len());
        for (k, v) in &selector.match_labels {
            match self.entries.get(&(k.clone(), v.clone())) {
                Some(keys) => sets.push(keys),
                None => return BTreeSet::new(),
            }
        }
        sets.sort_by_key(|s| s.len());

        let Some((smallest, rest)) = sets.split_first() else {
            return BTreeSet::new();
        };
        smallest
            .iter()
            .filter(|key| rest.iter().all(|s| s.contains(*key)))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
struct StoreState<T> {
    objects: BTreeMap<ObjectKey, T>,
    index: LabelIndex,
    last_version: u64,
}

/// In-memory [`ObjectStore`] with optimistic concurrency and change fan-out.
pub struct MemoryStore<T: Object> {
    state: RwLock<StoreState<T>>,
    events: broadcast::Sender<WatchEvent<T>>,
    clock: SharedClock,
    writes: AtomicU64,
}

impl<T: Object> MemoryStore<T> {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a store stamping creation times from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: RwLock::new(StoreState {
                objects: BTreeMap::new(),
                index: LabelIndex::default(),
                last_version: 0,
            }),
            events,
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of writes that changed stored state.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, event: WatchEvent<T>) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn check_version(stored: &T, incoming: &T) -> TesseraResult<()> {
        let expected = incoming.meta().resource_version;
        let found = stored.meta().resource_version;
        if expected != found {
            return Err(TesseraError::Conflict {
                kind: T::KIND,
                key: stored.key().to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }
}

impl<T: Object> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Object> ObjectStore<T> for MemoryStore<T> {
    async fn create(&self, mut object: T) -> TesseraResult<T> {
        let key = object.key();
        let created = {
            let mut state = self.state.write();
            if state.objects.contains_key(&key) {
                return Err(TesseraError::AlreadyExists {
                    kind: T::KIND,
                    key: key.to_string(),
                });
            }
            state.last_version += 1;
            let meta = object.meta_mut();
            meta.resource_version = state.last_version;
            meta.generation = 1;
            meta.creation_timestamp = Some(self.clock.now());

            state.index.insert(&key, &object.meta().labels);
            state.objects.insert(key.clone(), object.clone());
            object
        };

        tracing::trace!(kind = T::KIND, key = %key, "object created");
        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn get(&self, key: &ObjectKey) -> TesseraResult<T> {
        self.state
            .read()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| TesseraError::not_found(T::KIND, key))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> TesseraResult<Vec<T>> {
        let state = self.state.read();
        let in_namespace = |key: &ObjectKey| namespace.map_or(true, |ns| key.namespace == ns);

        let objects = if selector.is_empty() {
            state
                .objects
                .iter()
                .filter(|(key, _)| in_namespace(key))
                .map(|(_, object)| object.clone())
                .collect()
        } else {
            state
                .index
                .lookup(selector)
                .into_iter()
                .filter(|key| in_namespace(key))
                .filter_map(|key| state.objects.get(&key).cloned())
                .collect()
        };
        Ok(objects)
    }

    async fn update(&self, object: T) -> TesseraResult<T> {
        let key = object.key();
        let updated = {
            let mut state = self.state.write();
            let stored = state
                .objects
                .get(&key)
                .ok_or_else(|| TesseraError::not_found(T::KIND, &key))?;
            Self::check_version(stored, &object)?;

            let spec_changed = stored.spec() != object.spec();
            let labels_changed = stored.meta().labels != object.meta().labels;
            let owner_changed = stored.meta().owner != object.meta().owner;
            if spec_changed && T::IMMUTABLE_SPEC {
                return Err(TesseraError::ImmutableField {
                    kind: T::KIND,
                    key: key.to_string(),
                    field: "spec",
                });
            }
            if !spec_changed && !labels_changed && !owner_changed {
                return Ok(stored.clone());
            }

            let mut next = stored.clone();
            let old_labels = stored.meta().labels.clone();
            *next.spec_mut() = object.spec().clone();
            state.last_version += 1;
            let version = state.last_version;
            let meta = next.meta_mut();
            meta.labels = object.meta().labels.clone();
            meta.owner = object.meta().owner.clone();
            meta.resource_version = version;
            if spec_changed {
                meta.generation += 1;
            }

            if labels_changed {
                state.index.remove(&key, &old_labels);
                state.index.insert(&key, &next.meta().labels);
            }
            state.objects.insert(key.clone(), next.clone());
            next
        };

        tracing::trace!(kind = T::KIND, key = %key, "object updated");
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn update_status(&self, object: T) -> TesseraResult<T> {
        let key = object.key();
        let updated = {
            let mut state = self.state.write();
            let stored = state
                .objects
                .get(&key)
                .ok_or_else(|| TesseraError::not_found(T::KIND, &key))?;
            Self::check_version(stored, &object)?;
            if stored.status() == object.status() {
                return Ok(stored.clone());
            }

            let mut next = stored.clone();
            *next.status_mut() = object.status().clone();
            state.last_version += 1;
            next.meta_mut().resource_version = state.last_version;
            state.objects.insert(key.clone(), next.clone());
            next
        };

        tracing::trace!(kind = T::KIND, key = %key, "status updated");
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> TesseraResult<()> {
        let removed = {
            let mut state = self.state.write();
            let removed = state
                .objects
                .remove(key)
                .ok_or_else(|| TesseraError::not_found(T::KIND, key))?;
            state.index.remove(key, &removed.meta().labels);
            removed
        };

        tracing::trace!(kind = T::KIND, key = %key, "object deleted");
        self.publish(WatchEvent::Deleted(removed));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}
