//! Controller loop.
//!
//! A controller owns one [`WorkQueue`] and a pool of workers calling its
//! [`Reconciler`]. Event pumps translate store and secret changes into queue
//! keys. Reconciliation is level-triggered: a key carries no payload, the
//! reconciler always reads current state, and a lagging event subscriber
//! simply re-queues everything.

use super::queue::WorkQueue;
use crate::api::{ConfigRevision, LabelSelector, ObjectKey};
use crate::core::error::TesseraResult;
use crate::ops::observability::SharedMetrics;
use crate::store::object::{Object, ObjectStore, SharedStore};
use crate::store::revisions::RevisionStore;
use crate::store::secrets::SharedSecretStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Result of a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged.
    Done,
    /// Progress was made; run again.
    Requeue,
}

/// Drives one object towards its desired state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> TesseraResult<ReconcileOutcome>;
}

/// Worker pool settings.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub workers: usize,
    pub requeue_base: Duration,
    pub requeue_max: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            requeue_base: Duration::from_millis(100),
            requeue_max: Duration::from_secs(30),
        }
    }
}

/// A reconciler plus its queue and workers.
pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ObjectKey>>,
    workers: usize,
    metrics: SharedMetrics,
}

impl<R> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: self.reconciler.clone(),
            queue: self.queue.clone(),
            workers: self.workers,
            metrics: self.metrics.clone(),
        }
    }
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, settings: ControllerSettings, metrics: SharedMetrics) -> Self {
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new(settings.requeue_base, settings.requeue_max)),
            workers: settings.workers.max(1),
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    /// Process one key. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let name = self.reconciler.name();
        let started = Instant::now();
        let result = self.reconciler.reconcile(&key).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(ReconcileOutcome::Done) => {
                self.queue.forget(&key);
            }
            Ok(ReconcileOutcome::Requeue) => {
                self.queue.forget(&key);
                self.queue.add(key.clone());
            }
            Err(err) if err.is_retriable() => {
                let delay = self.queue.add_rate_limited(key.clone());
                tracing::warn!(
                    controller = name,
                    key = %key,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed, requeueing"
                );
            }
            Err(err) => {
                self.queue.forget(&key);
                tracing::warn!(
                    controller = name,
                    key = %key,
                    error = %err,
                    "reconcile failed, waiting for the next change"
                );
            }
        }

        self.metrics
            .record_reconcile(name, elapsed_ms, result.is_err());
        self.queue.done(&key);
        true
    }

    /// Spawn the worker pool.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { while controller.process_next().await {} })
            })
            .collect()
    }

    /// Run workers until shutdown, then drain them.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let workers = self.spawn_workers();
        tracing::debug!(controller = self.reconciler.name(), workers = workers.len(), "controller started");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        self.queue.shutdown();
        for worker in workers {
            let _ = worker.await;
        }
        tracing::debug!(controller = self.reconciler.name(), "controller stopped");
    }
}

/// Maps a changed object to the key that must be reconciled.
pub type KeyFn<T> = fn(&T) -> Option<ObjectKey>;

/// Key of the object itself.
pub fn own_key<T: Object>(object: &T) -> Option<ObjectKey> {
    Some(object.key())
}

/// Key of the object's owner.
pub fn owner_key<T: Object>(object: &T) -> Option<ObjectKey> {
    object.meta().owner.clone()
}

/// Queue the keys of every stored object.
pub async fn enqueue_all<T: Object>(
    store: &SharedStore<T>,
    queue: &WorkQueue<ObjectKey>,
    key_fn: KeyFn<T>,
) -> TesseraResult<usize> {
    let objects = store.list(None, &LabelSelector::everything()).await?;
    let mut count = 0;
    for key in objects.iter().filter_map(key_fn) {
        queue.add(key);
        count += 1;
    }
    Ok(count)
}

/// Forward store events to a queue until shutdown.
///
/// The subscription is taken before the task starts so no event between
/// this call and the first poll is missed.
pub fn spawn_watch<T: Object>(
    store: SharedStore<T>,
    queue: Arc<WorkQueue<ObjectKey>>,
    key_fn: KeyFn<T>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = store.watch();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(key) = key_fn(event.object()) {
                            queue.add(key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(kind = T::KIND, missed, "watch lagged, resyncing");
                        if let Err(err) = enqueue_all(&store, &queue, key_fn).await {
                            tracing::warn!(kind = T::KIND, error = %err, "resync failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Periodically queue every object. A zero interval disables the task.
pub fn spawn_resync<T: Object>(
    store: SharedStore<T>,
    queue: Arc<WorkQueue<ObjectKey>>,
    key_fn: KeyFn<T>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match enqueue_all(&store, &queue, key_fn).await {
                        Ok(count) => tracing::trace!(kind = T::KIND, count, "periodic resync"),
                        Err(err) => tracing::warn!(kind = T::KIND, error = %err, "periodic resync failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }))
}

/// Queue the published revisions of a namespace whose secrets changed.
pub fn spawn_secret_watch(
    secrets: SharedSecretStore,
    revisions: RevisionStore,
    queue: Arc<WorkQueue<ObjectKey>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut changes = secrets.subscribe();
    tokio::spawn(async move {
        loop {
            let namespace = tokio::select! {
                change = changes.recv() => match change {
                    Ok(key) => Some(key.namespace),
                    Err(broadcast::error::RecvError::Lagged(_)) => None,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            };
            if let Err(err) = enqueue_published(&revisions, &queue, namespace.as_deref()).await {
                tracing::warn!(error = %err, "failed to requeue revisions after secret change");
            }
        }
    })
}

async fn enqueue_published(
    revisions: &RevisionStore,
    queue: &WorkQueue<ObjectKey>,
    namespace: Option<&str>,
) -> TesseraResult<()> {
    let all: Vec<ConfigRevision> = revisions
        .objects()
        .list(namespace, &LabelSelector::everything())
        .await?;
    for revision in all.iter().filter(|r| r.is_published()) {
        queue.add(revision.key());
    }
    Ok(())
}
