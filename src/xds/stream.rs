//! State-of-the-world discovery stream.
//!
//! One [`DiscoveryStream`] runs per connected client. It binds to a node's
//! snapshot channel, keeps per-type subscription state, and answers a
//! request once the node's snapshot differs from what the client holds.
//!
//! Per type URL the stream remembers the version the client last reported,
//! the subscribed names, and the last response sent (nonce, slot version,
//! originating revision). A NACK is matched to that last response through
//! its nonce, which names the revision to taint.

use super::node::{NodeHash, UNKNOWN_NODE};
use super::proto::{Any, ControlPlane, DiscoveryRequest, DiscoveryResponse, Node};
use super::rejection::{Rejection, RejectionHandler};
use crate::api::{ApiVersion, ResourceType};
use crate::cache::snapshot::{RevisionTag, Snapshot};
use crate::cache::snapshot_cache::{SnapshotCache, SnapshotReceiver};
use crate::ops::observability::SharedMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

/// Everything a stream needs from the server.
#[derive(Clone)]
pub struct StreamContext {
    pub cache: Arc<SnapshotCache>,
    pub rejections: Arc<dyn RejectionHandler>,
    pub node_hash: Arc<dyn NodeHash>,
    pub metrics: SharedMetrics,
    pub api_version: ApiVersion,
    pub control_plane_id: String,
}

#[derive(Debug, Clone)]
struct SentResponse {
    nonce: String,
    version: String,
    revision: RevisionTag,
}

#[derive(Debug, Default)]
struct TypeWatch {
    /// Version the client reports holding.
    client_version: Option<String>,
    resource_names: Vec<String>,
    sent: Option<SentResponse>,
    rejected_version: Option<String>,
    /// A request is waiting for a response.
    open: bool,
    /// Subscription changed; respond even if versions match.
    force: bool,
}

impl TypeWatch {
    fn wants(&self, slot_version: &str) -> bool {
        if !self.open {
            return false;
        }
        if self.force {
            return true;
        }
        self.client_version.as_deref() != Some(slot_version)
            && self.rejected_version.as_deref() != Some(slot_version)
    }
}

enum Event {
    Request(Option<Result<DiscoveryRequest, Status>>),
    Snapshot(bool),
    Shutdown,
}

/// Per-client protocol state machine.
pub struct DiscoveryStream {
    ctx: StreamContext,
    stream_id: u64,
    node_id: Option<String>,
    snapshot: Option<SnapshotReceiver>,
    watches: BTreeMap<ResourceType, TypeWatch>,
    nonce: u64,
}

impl DiscoveryStream {
    pub fn new(ctx: StreamContext, stream_id: u64) -> Self {
        Self {
            ctx,
            stream_id,
            node_id: None,
            snapshot: None,
            watches: BTreeMap::new(),
            nonce: 0,
        }
    }

    /// Node the stream is bound to, once known.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Process one client request.
    ///
    /// Returns the rejection to report when the request is a NACK of a
    /// response this stream sent.
    #[allow(clippy::result_large_err)]
    pub fn handle_request(&mut self, request: DiscoveryRequest) -> Result<Option<Rejection>, Status> {
        let resource_type = self
            .ctx
            .api_version
            .resource_type_for(&request.type_url)
            .ok_or_else(|| {
                Status::invalid_argument(format!("unknown type url {:?}", request.type_url))
            })?;
        self.bind_node(request.node.as_ref());

        let node_id = self.node_id.clone().unwrap_or_else(|| UNKNOWN_NODE.to_string());
        let watch = self.watches.entry(resource_type).or_default();

        if let Some(sent) = &watch.sent {
            if !request.response_nonce.is_empty() && request.response_nonce != sent.nonce {
                tracing::trace!(
                    stream = self.stream_id,
                    node_id = %node_id,
                    type_url = %request.type_url,
                    nonce = %request.response_nonce,
                    "ignoring stale request"
                );
                return Ok(None);
            }
        }

        let mut rejection = None;
        if let Some(detail) = &request.error_detail {
            self.ctx.metrics.record_nack();
            match watch.sent.as_ref().filter(|s| s.nonce == request.response_nonce) {
                Some(sent) => {
                    watch.rejected_version = Some(sent.version.clone());
                    rejection = Some(Rejection {
                        node_id: node_id.clone(),
                        namespace: Some(sent.revision.key.namespace.clone()),
                        version: sent.revision.version.clone(),
                        api_version: self.ctx.api_version,
                        type_url: request.type_url.clone(),
                        message: detail.message.clone(),
                    });
                    tracing::warn!(
                        stream = self.stream_id,
                        node_id = %node_id,
                        type_url = %request.type_url,
                        version = %sent.revision.version,
                        reason = %detail.message,
                        "client rejected response"
                    );
                }
                None => {
                    tracing::debug!(
                        stream = self.stream_id,
                        node_id = %node_id,
                        type_url = %request.type_url,
                        "rejection without a matching response"
                    );
                }
            }
        } else if !request.response_nonce.is_empty() {
            self.ctx.metrics.record_ack();
        }

        watch.client_version = Some(request.version_info).filter(|v| !v.is_empty());
        if watch.resource_names != request.resource_names {
            watch.force = watch.sent.is_some();
            watch.resource_names = request.resource_names;
        }
        watch.open = true;
        Ok(rejection)
    }

    fn bind_node(&mut self, node: Option<&Node>) {
        let bound = match self.node_id.as_deref() {
            Some(UNKNOWN_NODE) => node.is_none(),
            Some(_) => true,
            None => false,
        };
        if bound {
            return;
        }
        let id = self.ctx.node_hash.id(node);
        if self.node_id.as_deref() == Some(id.as_str()) {
            return;
        }
        tracing::debug!(stream = self.stream_id, node_id = %id, "stream bound to node");
        self.detach();
        self.snapshot = Some(self.ctx.cache.subscribe(&id));
        self.node_id = Some(id);
    }

    /// Drop the snapshot subscription and let the cache forget an idle node.
    fn detach(&mut self) {
        if let Some(rx) = self.snapshot.take() {
            drop(rx);
            if let Some(node_id) = &self.node_id {
                self.ctx.cache.release(node_id);
            }
        }
    }

    fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// Responses owed to the client under the current snapshot.
    pub fn ready_responses(&mut self) -> Vec<DiscoveryResponse> {
        let Some(snapshot) = self.current_snapshot() else {
            return Vec::new();
        };
        let mut responses = Vec::new();
        for (resource_type, watch) in self.watches.iter_mut() {
            let slot = snapshot.slot(*resource_type);
            if !watch.wants(&slot.version) {
                continue;
            }

            self.nonce += 1;
            let nonce = self.nonce.to_string();
            let type_url = self.ctx.api_version.type_url(*resource_type);
            let resources = slot
                .select(&watch.resource_names)
                .into_iter()
                .map(|resource| Any {
                    type_url: type_url.to_string(),
                    value: resource.encode().to_vec(),
                })
                .collect();

            watch.sent = Some(SentResponse {
                nonce: nonce.clone(),
                version: slot.version.clone(),
                revision: snapshot.revision.clone(),
            });
            watch.open = false;
            watch.force = false;

            self.ctx.metrics.record_response(type_url);
            responses.push(DiscoveryResponse {
                version_info: slot.version.clone(),
                resources,
                canary: false,
                type_url: type_url.to_string(),
                nonce,
                control_plane: Some(ControlPlane {
                    identifier: self.ctx.control_plane_id.clone(),
                }),
            });
        }
        responses
    }

    async fn flush(
        &mut self,
        responses: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) -> bool {
        for response in self.ready_responses() {
            tracing::debug!(
                stream = self.stream_id,
                node_id = self.node_id.as_deref().unwrap_or(UNKNOWN_NODE),
                type_url = %response.type_url,
                version = %response.version_info,
                nonce = %response.nonce,
                resources = response.resources.len(),
                "sending response"
            );
            if responses.send(Ok(response)).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Serve the stream until the client leaves or the server shuts down.
    pub async fn run<S>(
        mut self,
        requests: S,
        responses: mpsc::Sender<Result<DiscoveryResponse, Status>>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + 'static,
    {
        let mut requests = std::pin::pin!(requests);
        self.ctx.metrics.stream_opened();
        tracing::debug!(stream = self.stream_id, "stream opened");

        let reason = loop {
            if *shutdown.borrow() {
                break "server shutting down";
            }
            let event = tokio::select! {
                request = requests.next() => Event::Request(request),
                changed = snapshot_changed(&mut self.snapshot) => Event::Snapshot(changed),
                _ = shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Request(Some(Ok(request))) => match self.handle_request(request) {
                    Ok(Some(rejection)) => {
                        let handler = self.ctx.rejections.clone();
                        tokio::spawn(async move { handler.on_rejection(rejection).await });
                    }
                    Ok(None) => {}
                    Err(status) => {
                        tracing::warn!(stream = self.stream_id, error = %status.message(), "closing stream");
                        let _ = responses.send(Err(status)).await;
                        break "invalid request";
                    }
                },
                Event::Request(Some(Err(status))) => {
                    tracing::debug!(stream = self.stream_id, error = %status.message(), "client stream error");
                    break "client error";
                }
                Event::Request(None) => break "client closed",
                Event::Snapshot(true) => {}
                Event::Snapshot(false) => self.snapshot = None,
                Event::Shutdown => break "server shutting down",
            }

            if !self.flush(&responses).await {
                break "client gone";
            }
        };

        self.ctx.metrics.stream_closed();
        tracing::debug!(
            stream = self.stream_id,
            node_id = self.node_id.as_deref().unwrap_or(UNKNOWN_NODE),
            reason,
            "stream closed"
        );
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn snapshot_changed(rx: &mut Option<SnapshotReceiver>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ObjectKey;
    use crate::cache::resource::Resource;
    use crate::ops::observability::{metrics, TesseraMetrics};
    use crate::xds::node::IdHash;
    use crate::xds::proto::Status as RpcStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<Rejection>>);

    #[async_trait]
    impl RejectionHandler for Recorded {
        async fn on_rejection(&self, rejection: Rejection) {
            self.0.lock().push(rejection);
        }
    }

    const CLUSTERS: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    fn context(cache: Arc<SnapshotCache>) -> (StreamContext, SharedMetrics) {
        let metrics = TesseraMetrics::shared();
        let ctx = StreamContext {
            cache,
            rejections: Arc::new(Recorded::default()),
            node_hash: Arc::new(IdHash),
            metrics: metrics.clone(),
            api_version: ApiVersion::V3,
            control_plane_id: "tessera".into(),
        };
        (ctx, metrics)
    }

    fn publish(cache: &SnapshotCache, revision: &str, clusters: &[&str]) {
        let resources = clusters
            .iter()
            .map(|name| {
                let resource = Resource::decode(ResourceType::Cluster, json!({ "name": name })).unwrap();
                (name.to_string(), resource)
            })
            .collect();
        cache.set(Snapshot::new(
            "n1",
            ApiVersion::V3,
            RevisionTag {
                key: ObjectKey::new("default", format!("n1-{}", revision)),
                version: revision.into(),
            },
            [(ResourceType::Cluster, resources)].into_iter().collect(),
        ));
    }

    fn request(version: &str, nonce: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: version.into(),
            node: Some(Node::new("n1")),
            type_url: CLUSTERS.into(),
            response_nonce: nonce.into(),
            ..Default::default()
        }
    }

    #[test]
    fn responds_until_acknowledged() {
        let cache = Arc::new(SnapshotCache::new());
        publish(&cache, "r1", &["a"]);
        let (ctx, metrics) = context(cache);
        let mut stream = DiscoveryStream::new(ctx, 1);

        assert_eq!(stream.handle_request(request("", "")).unwrap(), None);
        let responses = stream.ready_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].nonce, "1");
        assert_eq!(responses[0].resources.len(), 1);
        assert!(stream.ready_responses().is_empty());

        let version = responses[0].version_info.clone();
        stream.handle_request(request(&version, "1")).unwrap();
        assert!(stream.ready_responses().is_empty());
        assert_eq!(metrics.registry().counter_get(metrics::XDS_ACKS_TOTAL), 1);
    }

    #[test]
    fn closed_streams_leave_no_node_behind() {
        let cache = Arc::new(SnapshotCache::new());
        publish(&cache, "r1", &["a"]);

        for i in 0..100 {
            let (ctx, _) = context(cache.clone());
            let mut stream = DiscoveryStream::new(ctx, i);
            let mut req = request("", "");
            req.node = Some(Node::new(format!("visitor-{}", i)));
            stream.handle_request(req).unwrap();
            assert!(stream.ready_responses().is_empty());
        }
        assert_eq!(cache.tracked(), 1);

        // Rebinding from the unknown bucket releases it.
        let (ctx, _) = context(cache.clone());
        let mut stream = DiscoveryStream::new(ctx, 200);
        let mut anonymous = request("", "");
        anonymous.node = None;
        stream.handle_request(anonymous).unwrap();
        assert_eq!(cache.tracked(), 2);
        stream.handle_request(request("", "")).unwrap();
        assert_eq!(cache.tracked(), 1);
        drop(stream);
        assert_eq!(cache.nodes(), vec!["n1".to_string()]);
    }

    #[test]
    fn stale_nonce_is_ignored() {
        let cache = Arc::new(SnapshotCache::new());
        publish(&cache, "r1", &["a"]);
        let (ctx, _) = context(cache.clone());
        let mut stream = DiscoveryStream::new(ctx, 1);

        stream.handle_request(request("", "")).unwrap();
        let first = stream.ready_responses().remove(0);

        // A NACK quoting a nonce we never sent.
        let mut stale = request("", "99");
        stale.error_detail = Some(RpcStatus {
            code: 3,
            message: "bad".into(),
        });
        assert_eq!(stream.handle_request(stale).unwrap(), None);

        stream.handle_request(request(&first.version_info, "1")).unwrap();
        publish(&cache, "r2", &["a", "b"]);
        let second = stream.ready_responses();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].nonce, "2");
    }

    #[test]
    fn nack_names_the_revision_and_blocks_resend() {
        let cache = Arc::new(SnapshotCache::new());
        publish(&cache, "r1", &["a"]);
        let (ctx, metrics) = context(cache.clone());
        let mut stream = DiscoveryStream::new(ctx, 1);

        stream.handle_request(request("", "")).unwrap();
        let sent = stream.ready_responses().remove(0);

        let mut nack = request("", &sent.nonce);
        nack.error_detail = Some(RpcStatus {
            code: 3,
            message: "cluster a is bogus".into(),
        });
        let rejection = stream.handle_request(nack).unwrap().unwrap();
        assert_eq!(rejection.node_id, "n1");
        assert_eq!(rejection.version, "r1");
        assert_eq!(rejection.type_url, CLUSTERS);
        assert_eq!(metrics.registry().counter_get(metrics::XDS_NACKS_TOTAL), 1);

        // Same content is not pushed again.
        assert!(stream.ready_responses().is_empty());

        publish(&cache, "r0", &["z"]);
        let rolled_back = stream.ready_responses();
        assert_eq!(rolled_back.len(), 1);
        assert_ne!(rolled_back[0].version_info, sent.version_info);
    }

    #[test]
    fn resource_names_filter_and_force_a_response() {
        let cache = Arc::new(SnapshotCache::new());
        publish(&cache, "r1", &["a", "b"]);
        let (ctx, _) = context(cache);
        let mut stream = DiscoveryStream::new(ctx, 1);

        stream.handle_request(request("", "")).unwrap();
        let all = stream.ready_responses().remove(0);
        assert_eq!(all.resources.len(), 2);

        let mut narrowed = request(&all.version_info, &all.nonce);
        narrowed.resource_names = vec!["b".into()];
        stream.handle_request(narrowed).unwrap();
        let only_b = stream.ready_responses();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].resources.len(), 1);
    }

    #[test]
    fn unknown_type_url_is_invalid() {
        let (ctx, _) = context(Arc::new(SnapshotCache::new()));
        let mut stream = DiscoveryStream::new(ctx, 1);
        let mut bad = request("", "");
        bad.type_url = "type.googleapis.com/nope".into();
        let status = stream.handle_request(bad).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn node_is_kept_from_the_first_request() {
        let (ctx, _) = context(Arc::new(SnapshotCache::new()));
        let mut stream = DiscoveryStream::new(ctx, 1);

        let mut anonymous = request("", "");
        anonymous.node = None;
        stream.handle_request(anonymous.clone()).unwrap();
        assert_eq!(stream.node_id(), Some(UNKNOWN_NODE));

        stream.handle_request(request("", "")).unwrap();
        assert_eq!(stream.node_id(), Some("n1"));

        let mut other = request("", "");
        other.node = Some(Node::new("n2"));
        stream.handle_request(other).unwrap();
        stream.handle_request(anonymous).unwrap();
        assert_eq!(stream.node_id(), Some("n1"));
    }
}
