//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: stores → snapshot cache → controllers → manifests → metrics export → discovery server
//! - Shutdown order: discovery server → manifests and controllers → metrics export

use crate::api::{ConfigRequest, ConfigRevision};
use crate::cache::builder::CacheBuilder;
use crate::cache::snapshot_cache::SnapshotCache;
use crate::core::config::Config;
use crate::core::error::TesseraResult;
use crate::core::time::{system_clock, SharedClock};
use crate::ops::observability::{SharedMetrics, TesseraMetrics};
use crate::reconcile::{
    enqueue_all, own_key, owner_key, spawn_resync, spawn_secret_watch, spawn_watch, Controller,
    RequestReconciler, RevisionReconciler,
};
use crate::store::manifest::ManifestLoader;
use crate::store::memory::MemoryStore;
use crate::store::object::SharedStore;
use crate::store::revisions::RevisionStore;
use crate::store::secrets::{MemorySecretStore, SharedSecretStore};
use crate::xds::{DiscoveryServer, DiscoveryService, TaintOnRejection, TlsMaterial};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is not configured.
    Disabled,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub controllers: ComponentHealth,
    pub manifests: ComponentHealth,
    pub discovery: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            controllers: ComponentHealth::Starting,
            manifests: ComponentHealth::Starting,
            discovery: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is reconciling and serving.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.controllers, self.manifests, self.discovery),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Disabled,
                ComponentHealth::Healthy | ComponentHealth::Disabled
            )
        )
    }
}

/// Tessera runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    clock: SharedClock,
    metrics: SharedMetrics,

    requests: SharedStore<ConfigRequest>,
    revisions: RevisionStore,
    secrets: Arc<MemorySecretStore>,
    cache: Arc<SnapshotCache>,

    health: RuntimeHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    tasks: Vec<JoinHandle<()>>,
    server_handle: Option<JoinHandle<TesseraResult<()>>>,
    local_addr: Option<SocketAddr>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, system_clock())
    }

    /// Create a runtime whose stores and reconcilers read the given clock.
    pub fn with_clock(config: Config, clock: SharedClock) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = TesseraMetrics::shared();
        let requests: SharedStore<ConfigRequest> =
            Arc::new(MemoryStore::<ConfigRequest>::with_clock(clock.clone()));
        let revision_objects: SharedStore<ConfigRevision> =
            Arc::new(MemoryStore::<ConfigRevision>::with_clock(clock.clone()));

        Ok(Self {
            config: Arc::new(config),
            revisions: RevisionStore::new(revision_objects, clock.clone()),
            requests,
            secrets: Arc::new(MemorySecretStore::new()),
            cache: Arc::new(SnapshotCache::with_metrics(metrics.clone())),
            clock,
            metrics,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
            server_handle: None,
            local_addr: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn requests(&self) -> &SharedStore<ConfigRequest> {
        &self.requests
    }

    pub fn revisions(&self) -> &RevisionStore {
        &self.revisions
    }

    pub fn secrets(&self) -> &Arc<MemorySecretStore> {
        &self.secrets
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Address the discovery server listens on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    ///
    /// Components are started in order:
    /// 1. Controllers and their event pumps
    /// 2. Manifest loader
    /// 3. Metrics file export
    /// 4. Discovery server
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(bind = %self.config.discovery.bind, "starting Tessera runtime");

        self.start_controllers().await?;
        self.start_manifests().await?;
        self.start_metrics_export();
        self.start_discovery().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("Tessera runtime started");
        Ok(())
    }

    /// Start the request and revision controllers.
    async fn start_controllers(&mut self) -> Result<()> {
        tracing::debug!("starting controllers");
        let settings = self.config.controller.settings();
        let resync = self.config.controller.resync_interval();
        let shutdown = &self.shutdown_rx;

        let request_reconciler = RequestReconciler::new(
            self.requests.clone(),
            self.revisions.clone(),
            self.cache.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        )
        .with_max_revisions(self.config.controller.max_revisions);
        let requests = Controller::new(Arc::new(request_reconciler), settings, self.metrics.clone());

        let secrets: SharedSecretStore = self.secrets.clone();
        let builder = CacheBuilder::new(self.cache.clone(), secrets.clone());
        let revision_reconciler =
            RevisionReconciler::new(self.revisions.clone(), builder, self.metrics.clone());
        let revisions =
            Controller::new(Arc::new(revision_reconciler), settings, self.metrics.clone());

        let revision_objects = self.revisions.objects().clone();

        // Requests react to their own changes and to changes of owned revisions.
        self.tasks.push(spawn_watch(
            self.requests.clone(),
            requests.queue().clone(),
            own_key,
            shutdown.clone(),
        ));
        self.tasks.push(spawn_watch(
            revision_objects.clone(),
            requests.queue().clone(),
            owner_key,
            shutdown.clone(),
        ));
        self.tasks.push(spawn_watch(
            revision_objects.clone(),
            revisions.queue().clone(),
            own_key,
            shutdown.clone(),
        ));
        self.tasks.push(spawn_secret_watch(
            secrets,
            self.revisions.clone(),
            revisions.queue().clone(),
            shutdown.clone(),
        ));
        self.tasks.extend(spawn_resync(
            self.requests.clone(),
            requests.queue().clone(),
            own_key,
            resync,
            shutdown.clone(),
        ));
        self.tasks.extend(spawn_resync(
            revision_objects.clone(),
            revisions.queue().clone(),
            own_key,
            resync,
            shutdown.clone(),
        ));

        enqueue_all(&self.requests, requests.queue(), own_key).await?;
        enqueue_all(&revision_objects, revisions.queue(), own_key).await?;

        self.tasks.push(tokio::spawn(requests.run(shutdown.clone())));
        self.tasks.push(tokio::spawn(revisions.run(shutdown.clone())));

        self.health.controllers = ComponentHealth::Healthy;
        tracing::info!(
            workers = settings.workers,
            max_revisions = self.config.controller.max_revisions,
            "controllers started"
        );
        Ok(())
    }

    /// Load manifests and keep rescanning them.
    async fn start_manifests(&mut self) -> Result<()> {
        let Some(dir) = self.config.manifest_dir() else {
            self.health.manifests = ComponentHealth::Disabled;
            return Ok(());
        };

        let loader = Arc::new(ManifestLoader::new(
            dir.clone(),
            self.requests.clone(),
            self.secrets.clone(),
        ));
        let summary = loader
            .sync()
            .await
            .with_context(|| format!("failed to load manifests from {}", dir.display()))?;
        tracing::info!(
            dir = %dir.display(),
            created = summary.created,
            updated = summary.updated,
            "manifests loaded"
        );

        let interval = Duration::from_secs(self.config.manifests.rescan_interval_seconds);
        if !interval.is_zero() {
            let shutdown = self.shutdown_rx.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut shutdown_wait = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => loader.run(interval, shutdown).await,
                    _ = shutdown_wait.changed() => {}
                }
            }));
        }

        self.health.manifests = ComponentHealth::Healthy;
        Ok(())
    }

    /// Periodically write the metrics file, if configured.
    fn start_metrics_export(&mut self) {
        let Some(path) = self.config.telemetry.metrics_file.as_ref().map(PathBuf::from) else {
            return;
        };
        let interval = Duration::from_secs(self.config.telemetry.metrics_interval_seconds);
        let metrics = self.metrics.clone();
        let mut shutdown = self.shutdown_rx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                let stopping = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = shutdown.changed() => true,
                };
                if let Err(err) = metrics.write_to(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "failed to write metrics file");
                }
                if stopping {
                    break;
                }
            }
        }));
        tracing::debug!(interval_secs = interval.as_secs(), "metrics export started");
    }

    /// Bind and spawn the discovery server.
    async fn start_discovery(&mut self) -> Result<()> {
        let discovery = &self.config.discovery;
        let addr = self.config.discovery_addr()?;

        let rejections = Arc::new(TaintOnRejection::new(
            self.revisions.clone(),
            self.metrics.clone(),
        ));
        let service = DiscoveryService::new(
            self.cache.clone(),
            rejections,
            self.metrics.clone(),
            self.shutdown_rx.clone(),
        )
        .with_api_version(discovery.api_version)
        .with_buffer(discovery.stream_buffer);

        let mut server = DiscoveryServer::new(service);
        if let (Some(chain), Some(key)) = (&discovery.tls_chain_path, &discovery.tls_key_path) {
            let chain_pem = tokio::fs::read(chain)
                .await
                .with_context(|| format!("failed to read TLS chain {}", chain))?;
            let key_pem = tokio::fs::read(key)
                .await
                .with_context(|| format!("failed to read TLS key {}", key))?;
            let client_ca_pem = match &discovery.client_ca_path {
                Some(ca) => Some(
                    tokio::fs::read(ca)
                        .await
                        .with_context(|| format!("failed to read client CA {}", ca))?,
                ),
                None => None,
            };
            server = server.with_tls(TlsMaterial {
                chain_pem,
                key_pem,
                client_ca_pem,
            });
        } else {
            tracing::warn!(bind = %addr, "discovery server running without TLS");
        }

        let listener = DiscoveryServer::bind(addr).await?;
        self.local_addr = listener.local_addr().ok();
        self.server_handle = Some(tokio::spawn(server.serve(listener)));
        self.health.discovery = ComponentHealth::Healthy;
        tracing::info!(addr = ?self.local_addr, "discovery server started");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until SIGINT, a shutdown request, or a server failure.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown_requested = async {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        if let Some(mut handle) = self.server_handle.take() {
            let server_exited = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                    false
                }
                _ = shutdown_requested => {
                    tracing::info!("shutdown requested by component");
                    false
                }
                result = &mut handle => {
                    match result {
                        Ok(Ok(())) => tracing::info!("discovery server stopped normally"),
                        Ok(Err(e)) => tracing::error!(error = %e, "discovery server failed"),
                        Err(e) => tracing::error!(error = %e, "discovery server task panicked"),
                    }
                    true
                }
            };
            if server_exited {
                self.health.discovery = ComponentHealth::Failed;
            } else {
                self.server_handle = Some(handle);
            }
        } else {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                }
                _ = shutdown_requested => {
                    tracing::info!("shutdown requested by component");
                }
            }
        }

        self.stop().await
    }

    /// Stop all runtime components.
    ///
    /// The discovery server drains its streams first, then controllers,
    /// pumps and the metrics export finish their current iteration.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Tessera runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.server_handle.take() {
            self.health.discovery = ComponentHealth::Stopping;
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(Ok(()))) => tracing::info!("discovery server stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "discovery server stopped with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "discovery server task panicked"),
                Err(_) => tracing::warn!("discovery server stop timed out"),
            }
            self.health.discovery = ComponentHealth::Stopped;
        }

        self.health.controllers = ComponentHealth::Stopping;
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("background task stop timed out");
            }
        }
        self.health.controllers = ComponentHealth::Stopped;
        if self.health.manifests != ComponentHealth::Disabled {
            self.health.manifests = ComponentHealth::Stopped;
        }

        tracing::info!("Tessera runtime stopped");
        Ok(())
    }

    /// Start the runtime for tests (controllers and manifests, no listener).
    pub async fn start_for_tests(&mut self) -> Result<()> {
        self.start_controllers().await?;
        self.start_manifests().await?;
        self.health.discovery = ComponentHealth::Disabled;
        self.running.store(true, Ordering::Release);
        Ok(())
    }
}
