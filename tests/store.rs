//! Store tests: revision queries and manifest loading.

mod common;

use common::{cluster, request, Harness, NAMESPACE};
use std::sync::Arc;
use tessera::api::{
    ConfigRequest, ConfigRevision, ConfigRevisionSpec, ObjectKey, SerializationFormat,
    LABEL_VERSION,
};
use tessera::store::manifest::ManifestLoader;
use tessera::store::memory::MemoryStore;
use tessera::store::object::{ObjectStore, SharedStore};
use tessera::store::revisions::{RevisionFilter, StatusChange};
use tessera::store::revisions::reasons;
use tessera::store::secrets::{MemorySecretStore, SecretData, SecretStore};

fn revision(node_id: &str, version: &str) -> ConfigRevision {
    ConfigRevision::new(
        NAMESPACE,
        ConfigRevisionSpec {
            node_id: node_id.into(),
            api_version: Default::default(),
            version: version.into(),
            serialization: SerializationFormat::Json,
            resources: vec![cluster(version)],
        },
        None,
    )
}

// ============================================================================
// Revision store
// ============================================================================

#[tokio::test]
async fn exactly_one_lookup_rejects_zero_and_many() {
    let h = Harness::new();
    h.revisions.create(revision("n1", "v1")).await.unwrap();

    let filter = RevisionFilter::node("n1", Default::default()).with_version("v1");
    let found = h.revisions.get_exactly_one(&filter).await.unwrap();
    assert_eq!(found.version(), "v1");

    let missing = RevisionFilter::node("n1", Default::default()).with_version("v9");
    assert!(h.revisions.get_exactly_one(&missing).await.is_err());
    assert!(h.revisions.find_one(&missing).await.unwrap().is_none());

    // A second object carrying the same labels makes the lookup ambiguous.
    let mut twin = revision("n1", "v1");
    twin.metadata.name = "n1-twin".into();
    h.revisions.create(twin).await.unwrap();
    let err = h.revisions.get_exactly_one(&filter).await.unwrap_err();
    assert!(err.is_retriable());
    assert!(h.revisions.find_one(&filter).await.is_err());
}

#[tokio::test]
async fn drifted_labels_are_repaired() {
    let h = Harness::new();
    let mut created = h.revisions.create(revision("n1", "v1")).await.unwrap();
    created.metadata.labels.remove(LABEL_VERSION);
    let drifted = h.revision_objects.update(created).await.unwrap();

    let filter = RevisionFilter::node("n1", Default::default()).with_version("v1");
    assert!(h.revisions.find_one(&filter).await.unwrap().is_none());

    h.revisions.repair_labels(drifted).await.unwrap();
    assert!(h.revisions.find_one(&filter).await.unwrap().is_some());
}

#[tokio::test]
async fn owned_revisions_are_listed_by_owner() {
    let h = Harness::new();
    let key = h.apply(request("n1", vec![cluster("a")])).await;
    h.set_resources(&key, vec![cluster("b")]).await;
    h.apply(request("n2", vec![cluster("a")])).await;

    let owned = h.revisions.list_owned_by(&key).await.unwrap();
    assert_eq!(owned.len(), 2);
    assert!(owned.iter().all(|r| r.spec.node_id == "n1"));
}

#[tokio::test]
async fn repeated_status_patch_writes_once() {
    let h = Harness::new();
    let created = h.revisions.create(revision("n1", "v1")).await.unwrap();
    let key = created.metadata.key();
    let taint = [StatusChange::taint(reasons::CLIENT_REJECTED, "bad cluster")];

    let tainted = h.revisions.patch_status(&key, &taint).await.unwrap();
    assert!(tainted.is_tainted());
    let writes = h.revision_objects.write_count();

    let again = h.revisions.patch_status(&key, &taint).await.unwrap();
    assert!(again.is_tainted());
    assert_eq!(h.revision_objects.write_count(), writes);

    // The first taint reason sticks.
    let other = [StatusChange::taint(reasons::INVALID_RESOURCES, "other")];
    h.revisions.patch_status(&key, &other).await.unwrap();
    assert_eq!(h.revision_objects.write_count(), writes);
}

// ============================================================================
// Manifests
// ============================================================================

struct Manifests {
    dir: tempfile::TempDir,
    requests: Arc<MemoryStore<ConfigRequest>>,
    secrets: Arc<MemorySecretStore>,
    loader: ManifestLoader,
}

fn manifests() -> Manifests {
    let dir = tempfile::tempdir().unwrap();
    let requests = Arc::new(MemoryStore::<ConfigRequest>::new());
    let secrets = Arc::new(MemorySecretStore::new());
    let store: SharedStore<ConfigRequest> = requests.clone();
    let loader = ManifestLoader::new(dir.path(), store, secrets.clone());
    Manifests {
        dir,
        requests,
        secrets,
        loader,
    }
}

const EDGE_V1: &str = r#"
kind: ConfigRequest
metadata:
  name: edge
spec:
  nodeID: edge-1
  resources:
    - type: cluster
      value: '{"name":"backend"}'
---
kind: Secret
metadata:
  name: edge-cert
type: tls
data:
  tls.crt: CERT
  tls.key: KEY
"#;

const EDGE_V2: &str = r#"
kind: ConfigRequest
metadata:
  name: edge
spec:
  nodeID: edge-1
  resources:
    - type: cluster
      value: '{"name":"backend-v2"}'
"#;

#[tokio::test]
async fn manifest_directory_is_mirrored_into_the_stores() {
    let m = manifests();
    let path = m.dir.path().join("edge.yaml");
    let edge = ObjectKey::new(NAMESPACE, "edge");
    let cert = ObjectKey::new(NAMESPACE, "edge-cert");

    std::fs::write(&path, EDGE_V1).unwrap();
    let summary = m.loader.sync().await.unwrap();
    assert_eq!(summary.created, 1);
    let stored = m.requests.get(&edge).await.unwrap();
    assert_eq!(stored.spec.node_id, "edge-1");
    assert_eq!(
        m.secrets.get_secret(&cert).await.unwrap(),
        SecretData::tls("CERT", "KEY")
    );

    // Re-reading identical content writes nothing.
    let writes = m.requests.write_count();
    let summary = m.loader.sync().await.unwrap();
    assert_eq!(summary.unchanged, 1);
    assert_eq!(m.requests.write_count(), writes);

    // Changed spec updates; the dropped secret is removed.
    std::fs::write(&path, EDGE_V2).unwrap();
    let summary = m.loader.sync().await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.deleted, 1);
    assert!(m.secrets.get_secret(&cert).await.is_err());

    // Removing the file deletes the request.
    std::fs::remove_file(&path).unwrap();
    let summary = m.loader.sync().await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert!(m.requests.get(&edge).await.is_err());
}

#[tokio::test]
async fn unparsable_manifest_aborts_the_sync() {
    let m = manifests();
    std::fs::write(m.dir.path().join("good.yaml"), EDGE_V2).unwrap();
    std::fs::write(m.dir.path().join("bad.json"), "{not json").unwrap();

    assert!(m.loader.sync().await.is_err());
    assert!(m.requests.is_empty());
}
