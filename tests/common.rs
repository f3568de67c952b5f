//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tessera::api::{
    ConfigRequest, ConfigRequestSpec, ConfigRevision, LabelSelector, ObjectKey, ObjectMeta,
    ResourceEntry, ResourceType,
};
use tessera::cache::builder::CacheBuilder;
use tessera::cache::snapshot_cache::SnapshotCache;
use tessera::core::time::{ManualClock, SharedClock};
use tessera::ops::observability::{SharedMetrics, TesseraMetrics};
use tessera::reconcile::{ReconcileOutcome, Reconciler, RequestReconciler, RevisionReconciler};
use tessera::store::memory::MemoryStore;
use tessera::store::object::{ObjectStore, SharedStore};
use tessera::store::revisions::RevisionStore;
use tessera::store::secrets::{MemorySecretStore, SharedSecretStore};
use tessera::xds::TaintOnRejection;

pub const NAMESPACE: &str = "default";

/// Write a TOML configuration to a temp file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file.flush().expect("Failed to flush config");
    file
}

/// One cluster resource.
pub fn cluster(name: &str) -> ResourceEntry {
    ResourceEntry::value(ResourceType::Cluster, format!(r#"{{"name":"{}"}}"#, name))
}

/// One endpoint resource.
pub fn endpoint(cluster_name: &str) -> ResourceEntry {
    ResourceEntry::value(
        ResourceType::Endpoint,
        format!(r#"{{"cluster_name":"{}"}}"#, cluster_name),
    )
}

/// A request for `node_id` named after the node.
pub fn request(node_id: &str, resources: Vec<ResourceEntry>) -> ConfigRequest {
    ConfigRequest::new(
        ObjectMeta::new(NAMESPACE, node_id),
        ConfigRequestSpec::new(node_id, resources),
    )
}

/// Stores, cache and both reconcilers wired the way the runtime wires them,
/// driven by hand instead of by controllers.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub metrics: SharedMetrics,
    pub requests: Arc<MemoryStore<ConfigRequest>>,
    pub revision_objects: Arc<MemoryStore<ConfigRevision>>,
    pub revisions: RevisionStore,
    pub secrets: Arc<MemorySecretStore>,
    pub cache: Arc<SnapshotCache>,
    pub request_reconciler: RequestReconciler,
    pub revision_reconciler: RevisionReconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_max_revisions(tessera::reconcile::DEFAULT_MAX_REVISIONS)
    }

    pub fn with_max_revisions(max_revisions: usize) -> Self {
        let clock = ManualClock::shared(1_700_000_000);
        let shared_clock: SharedClock = clock.clone();
        let metrics = TesseraMetrics::shared();
        let requests = Arc::new(MemoryStore::<ConfigRequest>::with_clock(shared_clock.clone()));
        let revision_objects =
            Arc::new(MemoryStore::<ConfigRevision>::with_clock(shared_clock.clone()));
        let revisions = RevisionStore::new(revision_objects.clone(), shared_clock.clone());
        let secrets = Arc::new(MemorySecretStore::new());
        let cache = Arc::new(SnapshotCache::with_metrics(metrics.clone()));

        let request_store: SharedStore<ConfigRequest> = requests.clone();
        let request_reconciler = RequestReconciler::new(
            request_store,
            revisions.clone(),
            cache.clone(),
            shared_clock,
            metrics.clone(),
        )
        .with_max_revisions(max_revisions);
        let secret_store: SharedSecretStore = secrets.clone();
        let revision_reconciler = RevisionReconciler::new(
            revisions.clone(),
            CacheBuilder::new(cache.clone(), secret_store),
            metrics.clone(),
        );

        Self {
            clock,
            metrics,
            requests,
            revision_objects,
            revisions,
            secrets,
            cache,
            request_reconciler,
            revision_reconciler,
        }
    }

    /// Store a request and reconcile until it settles.
    pub async fn apply(&self, request: ConfigRequest) -> ObjectKey {
        let key = request.metadata.key();
        match self.requests.get(&key).await {
            Ok(mut existing) => {
                existing.spec = request.spec;
                self.requests.update(existing).await.unwrap();
            }
            Err(_) => {
                self.requests.create(request).await.unwrap();
            }
        }
        self.converge(&key).await;
        key
    }

    /// Replace a stored request's resources without reconciling.
    pub async fn store_resources(&self, key: &ObjectKey, resources: Vec<ResourceEntry>) {
        let mut existing = self.requests.get(key).await.unwrap();
        existing.spec.resources = Some(resources);
        existing.spec.legacy_resources = None;
        self.requests.update(existing).await.unwrap();
    }

    /// Replace a stored request's resources and reconcile until it settles.
    pub async fn set_resources(&self, key: &ObjectKey, resources: Vec<ResourceEntry>) {
        self.store_resources(key, resources).await;
        self.converge(key).await;
    }

    /// Alternate request and revision passes until the request is done.
    pub async fn converge(&self, key: &ObjectKey) {
        for _ in 0..8 {
            let outcome = self.request_reconciler.reconcile(key).await.unwrap();
            self.reconcile_revisions().await;
            if outcome == ReconcileOutcome::Done {
                return;
            }
        }
        panic!("request {} did not converge", key);
    }

    /// One revision reconciler pass over every stored revision.
    pub async fn reconcile_revisions(&self) {
        let all = self
            .revision_objects
            .list(None, &LabelSelector::everything())
            .await
            .unwrap();
        for revision in all {
            let _ = self
                .revision_reconciler
                .reconcile(&revision.metadata.key())
                .await;
        }
    }

    pub async fn request_status(&self, key: &ObjectKey) -> tessera::api::ConfigRequestStatus {
        self.requests.get(key).await.unwrap().status
    }

    /// Every revision of a node, any state.
    pub async fn node_revisions(&self, node_id: &str) -> Vec<ConfigRevision> {
        self.revision_objects
            .list(
                None,
                &LabelSelector::everything().with(tessera::api::LABEL_NODE_ID, node_id),
            )
            .await
            .unwrap()
    }

    pub async fn published(&self, node_id: &str) -> Vec<ConfigRevision> {
        self.node_revisions(node_id)
            .await
            .into_iter()
            .filter(|r| r.is_published())
            .collect()
    }

    pub async fn revision_for(&self, node_id: &str, version: &str) -> ConfigRevision {
        self.node_revisions(node_id)
            .await
            .into_iter()
            .find(|r| r.version() == version)
            .unwrap_or_else(|| panic!("no revision {} for {}", version, node_id))
    }

    /// Rejection handler backed by this harness' revision store.
    pub fn rejection_handler(&self) -> TaintOnRejection {
        TaintOnRejection::new(self.revisions.clone(), self.metrics.clone())
    }

    /// Total writes across both stores and the snapshot cache.
    pub fn total_writes(&self) -> u64 {
        self.requests.write_count() + self.revision_objects.write_count() + self.cache.write_count()
    }
}
