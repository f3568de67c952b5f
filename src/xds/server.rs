//! Aggregated discovery gRPC server.
//!
//! The service is wired into tonic by hand: a `Service` wrapper routes the
//! single bidirectional method through `tonic::server::Grpc` with the prost
//! codec, so no build-time codegen is needed.

use super::node::{IdHash, NodeHash};
use super::proto::{DiscoveryRequest, DiscoveryResponse};
use super::rejection::RejectionHandler;
use super::stream::{DiscoveryStream, StreamContext};
use crate::api::ApiVersion;
use crate::cache::snapshot_cache::SnapshotCache;
use crate::core::error::{TesseraError, TesseraResult};
use crate::ops::observability::SharedMetrics;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::Status;

/// Fully qualified service name.
pub const ADS_SERVICE: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";

/// Path of the state-of-the-world stream method.
pub const ADS_STREAM_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// Identifier stamped on every response.
pub const CONTROL_PLANE_ID: &str = "tessera";

/// Response stream handed back to tonic.
pub type ResponseStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

/// PEM material for the listener.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// Require client certificates signed by this CA.
    pub client_ca_pem: Option<Vec<u8>>,
}

impl TlsMaterial {
    fn server_config(&self) -> ServerTlsConfig {
        let config =
            ServerTlsConfig::new().identity(Identity::from_pem(&self.chain_pem, &self.key_pem));
        match &self.client_ca_pem {
            Some(ca) => config.client_ca_root(Certificate::from_pem(ca)),
            None => config,
        }
    }
}

/// Stream factory shared by every connection.
#[derive(Clone)]
pub struct DiscoveryService {
    ctx: StreamContext,
    buffer: usize,
    shutdown: watch::Receiver<bool>,
    next_stream: Arc<AtomicU64>,
}

impl DiscoveryService {
    pub fn new(
        cache: Arc<SnapshotCache>,
        rejections: Arc<dyn RejectionHandler>,
        metrics: SharedMetrics,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx: StreamContext {
                cache,
                rejections,
                node_hash: Arc::new(IdHash),
                metrics,
                api_version: ApiVersion::V3,
                control_plane_id: CONTROL_PLANE_ID.to_string(),
            },
            buffer: 16,
            shutdown,
            next_stream: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_api_version(mut self, api_version: ApiVersion) -> Self {
        self.ctx.api_version = api_version;
        self
    }

    /// Bound on queued responses per stream.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn with_node_hash(mut self, node_hash: Arc<dyn NodeHash>) -> Self {
        self.ctx.node_hash = node_hash;
        self
    }

    /// Start serving one client stream.
    pub fn open_stream<S>(&self, requests: S) -> ResponseStream
    where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.buffer);
        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let stream = DiscoveryStream::new(self.ctx.clone(), stream_id);
        tokio::spawn(stream.run(requests, tx, self.shutdown.clone()));
        ReceiverStream::new(rx)
    }
}

/// Listener plus service.
pub struct DiscoveryServer {
    service: DiscoveryService,
    tls: Option<TlsMaterial>,
}

impl DiscoveryServer {
    pub fn new(service: DiscoveryService) -> Self {
        Self { service, tls: None }
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bind the listen address.
    pub async fn bind(addr: SocketAddr) -> TesseraResult<TcpListener> {
        TcpListener::bind(addr).await.map_err(|e| TesseraError::Internal {
            message: format!("failed to bind discovery listener {}: {}", addr, e),
        })
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> TesseraResult<()> {
        let addr = listener.local_addr().map_err(|e| TesseraError::Internal {
            message: format!("discovery listener has no address: {}", e),
        })?;
        let incoming = tonic::transport::server::TcpIncoming::from_listener(listener, true, None)
            .map_err(|e| TesseraError::Internal {
                message: format!("discovery listener error: {}", e),
            })?;

        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder
                .tls_config(tls.server_config())
                .map_err(|e| TesseraError::Internal {
                    message: format!("invalid discovery TLS configuration: {}", e),
                })?;
        }

        let mut shutdown_rx = self.service.shutdown.clone();
        tracing::info!(%addr, tls = self.tls.is_some(), "starting discovery server");

        builder
            .add_service(AdsServer::new(self.service))
            .serve_with_incoming_shutdown(incoming, async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                tracing::info!("discovery server shutting down");
            })
            .await
            .map_err(|e| TesseraError::Internal {
                message: format!("discovery server error: {}", e),
            })
    }
}

// ============================================================================
// Tonic Service Wrapper
// ============================================================================

/// Routes `StreamAggregatedResources` to a [`DiscoveryService`].
#[derive(Clone)]
pub struct AdsServer {
    inner: DiscoveryService,
}

impl AdsServer {
    pub fn new(inner: DiscoveryService) -> Self {
        Self { inner }
    }
}

impl tonic::server::NamedService for AdsServer {
    const NAME: &'static str = ADS_SERVICE;
}

struct StreamAggregatedResources(DiscoveryService);

impl tonic::server::StreamingService<DiscoveryRequest> for StreamAggregatedResources {
    type Response = DiscoveryResponse;
    type ResponseStream = ResponseStream;
    type Future = std::future::Ready<Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<tonic::Streaming<DiscoveryRequest>>) -> Self::Future {
        if let Some(peer) = request.remote_addr() {
            tracing::debug!(%peer, "discovery stream accepted");
        }
        std::future::ready(Ok(tonic::Response::new(
            self.0.open_stream(request.into_inner()),
        )))
    }
}

impl<B> tonic::codegen::Service<tonic::codegen::http::Request<B>> for AdsServer
where
    B: tonic::codegen::Body + Send + 'static,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = tonic::codegen::http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: tonic::codegen::http::Request<B>) -> Self::Future {
        if req.uri().path() != ADS_STREAM_PATH {
            let path = req.uri().path().to_string();
            tracing::warn!(path = %path, "unknown discovery method");
            return Box::pin(async move {
                Ok(Status::unimplemented(format!("Unknown method: {}", path)).into_http())
            });
        }

        let method = StreamAggregatedResources(self.inner.clone());
        Box::pin(async move {
            let codec = tonic::codec::ProstCodec::<DiscoveryResponse, DiscoveryRequest>::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.streaming(method, req).await)
        })
    }
}
