//! Discovery protocol tests: NACK-driven rollback and the gRPC server.

mod common;

use common::{cluster, request, Harness};
use std::sync::Arc;
use std::time::Duration;
use tessera::api::{ApiVersion, CacheState, ResourceType};
use tessera::ops::observability::metrics;
use tessera::xds::proto::{DiscoveryRequest, DiscoveryResponse, Node, Status};
use tessera::xds::{
    DiscoveryServer, DiscoveryService, DiscoveryStream, IdHash, RejectionHandler, StreamContext,
    ADS_STREAM_PATH,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

fn clusters_url() -> String {
    ApiVersion::V3.type_url(ResourceType::Cluster).to_string()
}

fn cluster_request(node_id: &str, version: &str, nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: version.into(),
        node: Some(Node::new(node_id)),
        type_url: clusters_url(),
        response_nonce: nonce.into(),
        ..Default::default()
    }
}

fn nack(node_id: &str, nonce: &str, message: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        error_detail: Some(Status {
            code: 3,
            message: message.into(),
        }),
        ..cluster_request(node_id, "", nonce)
    }
}

fn resource_names(response: &DiscoveryResponse) -> Vec<String> {
    response
        .resources
        .iter()
        .map(|any| {
            let value: serde_json::Value = serde_json::from_slice(&any.value).unwrap();
            value["name"].as_str().unwrap_or_default().to_string()
        })
        .collect()
}

fn stream_for(h: &Harness, rejections: Arc<dyn RejectionHandler>) -> DiscoveryStream {
    let ctx = StreamContext {
        cache: h.cache.clone(),
        rejections,
        node_hash: Arc::new(IdHash),
        metrics: h.metrics.clone(),
        api_version: ApiVersion::V3,
        control_plane_id: "tessera".into(),
    };
    DiscoveryStream::new(ctx, 1)
}

// ============================================================================
// Rejection flow
// ============================================================================

#[tokio::test]
async fn nack_taints_revision_and_previous_version_is_served() {
    let h = Harness::new();
    let key = h.apply(request("n1", vec![cluster("v1")])).await;
    h.set_resources(&key, vec![cluster("v2")]).await;

    let handler = Arc::new(h.rejection_handler());
    let mut stream = stream_for(&h, handler.clone());

    assert!(stream
        .handle_request(cluster_request("n1", "", ""))
        .unwrap()
        .is_none());
    let first = stream.ready_responses();
    assert_eq!(first.len(), 1);
    assert_eq!(resource_names(&first[0]), vec!["v2"]);

    let rejection = stream
        .handle_request(nack("n1", &first[0].nonce, "unknown field"))
        .unwrap()
        .expect("rejection for the sent response");
    let v2 = h.published("n1").await[0].version().to_string();
    assert_eq!(rejection.node_id, "n1");
    assert_eq!(rejection.version, v2);
    assert_eq!(rejection.message, "unknown field");

    // The rejected content is not offered again.
    assert!(stream.ready_responses().is_empty());

    handler.on_rejection(rejection).await;
    assert!(h.revision_for("n1", &v2).await.is_tainted());
    assert_eq!(
        h.metrics
            .registry()
            .counter_get(metrics::REVISION_TAINTED_TOTAL),
        1
    );

    h.converge(&key).await;
    assert_eq!(
        h.request_status(&key).await.cache_state,
        Some(CacheState::Rollback)
    );

    let second = stream.ready_responses();
    assert_eq!(second.len(), 1);
    assert_eq!(resource_names(&second[0]), vec!["v1"]);
    assert_ne!(second[0].nonce, first[0].nonce);

    // ACK of the rollback version settles the stream.
    stream
        .handle_request(cluster_request(
            "n1",
            &second[0].version_info,
            &second[0].nonce,
        ))
        .unwrap();
    assert!(stream.ready_responses().is_empty());
    assert_eq!(h.metrics.registry().counter_get(metrics::XDS_NACKS_TOTAL), 1);
    assert_eq!(h.metrics.registry().counter_get(metrics::XDS_ACKS_TOTAL), 1);
}

#[tokio::test]
async fn stream_without_node_uses_unknown_bucket() {
    let h = Harness::new();
    h.apply(request("n1", vec![cluster("a")])).await;
    let mut stream = stream_for(&h, Arc::new(h.rejection_handler()));

    let mut req = cluster_request("n1", "", "");
    req.node = None;
    stream.handle_request(req).unwrap();
    assert_eq!(stream.node_id(), Some(tessera::xds::UNKNOWN_NODE));
    assert!(stream.ready_responses().is_empty());

    stream
        .handle_request(cluster_request("n1", "", ""))
        .unwrap();
    assert_eq!(stream.node_id(), Some("n1"));
    assert_eq!(stream.ready_responses().len(), 1);
}

// ============================================================================
// gRPC server
// ============================================================================

async fn next_response(
    inbound: &mut tonic::Streaming<DiscoveryResponse>,
) -> DiscoveryResponse {
    tokio::time::timeout(Duration::from_secs(5), inbound.next())
        .await
        .expect("response in time")
        .expect("stream open")
        .expect("response ok")
}

#[tokio::test]
async fn ads_over_grpc_serves_and_rolls_back() {
    let h = Harness::new();
    let key = h.apply(request("n1", vec![cluster("v1")])).await;
    h.set_resources(&key, vec![cluster("v2")]).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = DiscoveryService::new(
        h.cache.clone(),
        Arc::new(h.rejection_handler()),
        h.metrics.clone(),
        shutdown_rx,
    );
    let listener = DiscoveryServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(DiscoveryServer::new(service).serve(listener));

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{}", addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = tonic::client::Grpc::new(channel);
    client.ready().await.unwrap();

    let (tx, rx) = mpsc::channel(8);
    tx.send(cluster_request("n1", "", "")).await.unwrap();
    let codec = tonic::codec::ProstCodec::<DiscoveryRequest, DiscoveryResponse>::default();
    let path = tonic::codegen::http::uri::PathAndQuery::from_static(ADS_STREAM_PATH);
    let mut inbound = client
        .streaming(tonic::Request::new(ReceiverStream::new(rx)), path, codec)
        .await
        .unwrap()
        .into_inner();

    let first = next_response(&mut inbound).await;
    assert_eq!(first.type_url, clusters_url());
    assert_eq!(resource_names(&first), vec!["v2"]);
    assert_eq!(
        first.control_plane.as_ref().map(|c| c.identifier.as_str()),
        Some("tessera")
    );

    tx.send(nack("n1", &first.nonce, "bad cluster")).await.unwrap();

    // The rejection handler runs off the stream task; wait for the taint.
    let v2 = tessera::cache::hash::resources_hash(&[cluster("v2")], Default::default());
    let mut tainted = false;
    for _ in 0..50 {
        if h.revision_for("n1", &v2).await.is_tainted() {
            tainted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(tainted, "rejected revision was not tainted");

    h.converge(&key).await;
    let second = next_response(&mut inbound).await;
    assert_eq!(resource_names(&second), vec!["v1"]);

    shutdown_tx.send(true).unwrap();
    drop(tx);
    drop(inbound);
    drop(client);
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stopped")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn unknown_type_url_closes_the_stream_with_invalid_argument() {
    let h = Harness::new();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = DiscoveryService::new(
        h.cache.clone(),
        Arc::new(h.rejection_handler()),
        h.metrics.clone(),
        shutdown_rx,
    );

    let (tx, rx) = mpsc::channel(4);
    let mut responses = service.open_stream(ReceiverStream::new(rx));
    tx.send(Ok(DiscoveryRequest {
        node: Some(Node::new("n1")),
        type_url: "type.googleapis.com/example.Unknown".into(),
        ..Default::default()
    }))
    .await
    .unwrap();

    let status = responses.next().await.unwrap().unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(responses.next().await.is_none());
}
