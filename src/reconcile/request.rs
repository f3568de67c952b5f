//! Request reconciler.
//!
//! For one `ConfigRequest`:
//!
//! 1. Ensure a revision exists for the desired content version; creating one
//!    ends the pass with a requeue.
//! 2. List the node's revisions in publication-priority order.
//! 3. Select the untainted revision with the highest priority.
//! 4. Unpublish every other revision, then publish the selection.
//! 5. Delete the lowest-priority revisions above the retention cap.
//! 6. Write the request status if it changed.
//!
//! Every step reads current state and only writes what differs, so any
//! number of redundant passes converge on the same result.

use super::controller::{ReconcileOutcome, Reconciler};
use crate::api::{
    CacheState, ConditionType, ConfigRequest, ConfigRequestStatus, ConfigRevision,
    ConfigRevisionSpec, LabelSelector, ObjectKey, RevisionRef,
};
use crate::cache::hash::resources_hash;
use crate::cache::snapshot_cache::SnapshotCache;
use crate::core::error::{TesseraError, TesseraResult};
use crate::core::time::SharedClock;
use crate::ops::observability::SharedMetrics;
use crate::store::object::{Object, ObjectStore, SharedStore};
use crate::store::revisions::{
    select_publish_target, sort_by_priority, RevisionFilter, RevisionStore, StatusChange,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Retention cap used when none is configured.
pub const DEFAULT_MAX_REVISIONS: usize = 10;

mod reasons {
    pub const IN_SYNC: &str = "InSync";
    pub const ROLLBACK: &str = "Rollback";
    pub const ROLLBACK_FAILED: &str = "RollbackFailed";
    pub const INVALID_REQUEST: &str = "InvalidRequest";
    pub const NODE_CLAIMED: &str = "NodeClaimed";
}

/// Reconciles `ConfigRequest` objects.
pub struct RequestReconciler {
    requests: SharedStore<ConfigRequest>,
    revisions: RevisionStore,
    cache: Arc<SnapshotCache>,
    clock: SharedClock,
    metrics: SharedMetrics,
    max_revisions: usize,
    states: Mutex<HashMap<ObjectKey, CacheState>>,
}

impl RequestReconciler {
    pub fn new(
        requests: SharedStore<ConfigRequest>,
        revisions: RevisionStore,
        cache: Arc<SnapshotCache>,
        clock: SharedClock,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            requests,
            revisions,
            cache,
            clock,
            metrics,
            max_revisions: DEFAULT_MAX_REVISIONS,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retention cap.
    pub fn with_max_revisions(mut self, max_revisions: usize) -> Self {
        self.max_revisions = max_revisions.max(1);
        self
    }

    /// Delete everything a removed request owned.
    async fn cleanup(&self, key: &ObjectKey) -> TesseraResult<ReconcileOutcome> {
        let owned = self.revisions.list_owned_by(key).await?;
        let mut deleted = 0;
        for revision in &owned {
            let revision_key = revision.key();
            self.cache.remove_by_revision(&revision_key);
            match self.revisions.delete(&revision_key).await {
                Ok(()) => deleted += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if deleted > 0 {
            tracing::info!(request = %key, deleted, "request removed, deleted its revisions");
            self.metrics.record_revisions_deleted(deleted);
        }
        self.forget_state(key);
        Ok(ReconcileOutcome::Done)
    }

    /// The request that owns this request's node and API version, if it is
    /// another one. The oldest request wins; ties go to the smaller key.
    async fn node_owner(&self, request: &ConfigRequest) -> TesseraResult<Option<ObjectKey>> {
        let spec = &request.spec;
        let owner = self
            .requests
            .list(None, &LabelSelector::everything())
            .await?
            .into_iter()
            .filter(|other| {
                other.spec.node_id == spec.node_id && other.spec.api_version == spec.api_version
            })
            .min_by(|a, b| {
                (a.metadata.created_at(), a.key()).cmp(&(b.metadata.created_at(), b.key()))
            })
            .map(|owner| owner.key());
        Ok(owner.filter(|owner| owner != &request.key()))
    }

    /// Surface an invalid spec on the request status.
    async fn reject(
        &self,
        request: ConfigRequest,
        reason: &str,
        err: TesseraError,
    ) -> TesseraResult<ReconcileOutcome> {
        let mut status = request.status.clone();
        status.conditions.set(
            ConditionType::CacheOutOfSync,
            true,
            reason,
            &err.to_string(),
            self.clock.now(),
        );
        if status != request.status {
            let mut updated = request;
            updated.status = status;
            self.requests.update_status(updated).await?;
        }
        Err(err)
    }

    /// Delete the lowest-priority revisions above the cap, never the selected one.
    async fn enforce_retention(
        &self,
        sorted: &mut Vec<ConfigRevision>,
        selected: Option<&ObjectKey>,
    ) -> TesseraResult<()> {
        if sorted.len() <= self.max_revisions {
            return Ok(());
        }
        let excess = sorted.len() - self.max_revisions;
        let doomed: Vec<ObjectKey> = sorted
            .iter()
            .map(ConfigRevision::key)
            .filter(|key| Some(key) != selected)
            .take(excess)
            .collect();

        let mut deleted = 0;
        for key in &doomed {
            match self.revisions.delete(key).await {
                Ok(()) => {
                    tracing::info!(revision = %key, "retention cap reached, revision deleted");
                    deleted += 1;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if deleted > 0 {
            self.metrics.record_revisions_deleted(deleted);
        }
        sorted.retain(|r| !doomed.contains(&r.key()));
        Ok(())
    }

    fn record_state(&self, key: &ObjectKey, state: CacheState) {
        let mut states = self.states.lock();
        states.insert(key.clone(), state);
        self.publish_state_gauges(&states);
    }

    fn forget_state(&self, key: &ObjectKey) {
        let mut states = self.states.lock();
        if states.remove(key).is_some() {
            self.publish_state_gauges(&states);
        }
    }

    fn publish_state_gauges(&self, states: &HashMap<ObjectKey, CacheState>) {
        let count = |wanted: CacheState| states.values().filter(|s| **s == wanted).count() as u64;
        self.metrics
            .set_cache_states(count(CacheState::Rollback), count(CacheState::RollbackFailed));
    }
}

#[async_trait]
impl Reconciler for RequestReconciler {
    fn name(&self) -> &'static str {
        "request"
    }

    async fn reconcile(&self, key: &ObjectKey) -> TesseraResult<ReconcileOutcome> {
        let request = match self.requests.get(key).await {
            Ok(request) => request,
            Err(err) if err.is_not_found() => return self.cleanup(key).await,
            Err(err) => return Err(err),
        };
        if let Err(err) = request.spec.validate() {
            return self.reject(request, reasons::INVALID_REQUEST, err).await;
        }
        if let Some(owner) = self.node_owner(&request).await? {
            let err = TesseraError::invalid(format!(
                "node {} ({}) is already configured by {}",
                request.spec.node_id, request.spec.api_version, owner
            ));
            return self.reject(request, reasons::NODE_CLAIMED, err).await;
        }

        let spec = &request.spec;
        let entries = spec.normalized_resources();
        let desired = resources_hash(&entries, spec.serialization);
        let filter = RevisionFilter::node(spec.node_id.clone(), spec.api_version)
            .in_namespace(key.namespace.clone());

        // 1. Ensure the desired revision exists.
        if self
            .revisions
            .find_one(&filter.clone().with_version(desired.clone()))
            .await?
            .is_none()
        {
            let revision = ConfigRevision::new(
                &key.namespace,
                ConfigRevisionSpec {
                    node_id: spec.node_id.clone(),
                    api_version: spec.api_version,
                    version: desired.clone(),
                    serialization: spec.serialization,
                    resources: entries,
                },
                Some(key.clone()),
            );
            let revision_key = revision.key();
            match self.revisions.create(revision).await {
                Ok(_) => {
                    tracing::info!(request = %key, revision = %revision_key, version = %desired, "revision created");
                    self.metrics.record_revision_created();
                }
                Err(err @ TesseraError::AlreadyExists { .. }) => {
                    // Present under its name but not found by its labels.
                    let existing = self.revisions.get(&revision_key).await?;
                    let same_identity = existing.spec.node_id == spec.node_id
                        && existing.spec.api_version == spec.api_version
                        && existing.spec.version == desired;
                    if !same_identity {
                        return Err(err);
                    }
                    self.revisions.repair_labels(existing).await?;
                }
                Err(err) => return Err(err),
            }
            return Ok(ReconcileOutcome::Requeue);
        }

        // 2-3. History and selection.
        let mut history = self.revisions.list(&filter).await?;
        sort_by_priority(&mut history, &desired);
        let target = select_publish_target(&history, &desired).map(ConfigRevision::key);

        // 4. Publication flags, unpublishing first.
        for revision in history.iter_mut() {
            let revision_key = revision.key();
            let published = revision.is_published() || revision.status.published;
            if published && Some(&revision_key) != target.as_ref() {
                *revision = self
                    .revisions
                    .patch_status(&revision_key, &[StatusChange::Unpublish])
                    .await?;
                tracing::info!(revision = %revision_key, "revision unpublished");
            }
        }
        if let Some(target_key) = &target {
            if let Some(revision) = history.iter_mut().find(|r| &r.key() == target_key) {
                if !revision.is_published() || !revision.status.published {
                    *revision = self
                        .revisions
                        .patch_status(target_key, &[StatusChange::Publish])
                        .await?;
                    tracing::info!(revision = %target_key, version = %revision.version(), "revision published");
                }
            }
        }
        sort_by_priority(&mut history, &desired);

        // 5. Retention.
        self.enforce_retention(&mut history, target.as_ref()).await?;

        // 6. Status.
        let selected = target
            .as_ref()
            .and_then(|k| history.iter().find(|r| &r.key() == k));
        let (cache_state, published_version) = match selected {
            None => (CacheState::RollbackFailed, None),
            Some(r) if r.version() == desired => (CacheState::InSync, Some(r.version().to_string())),
            Some(r) => (CacheState::Rollback, Some(r.version().to_string())),
        };

        let now = self.clock.now();
        let mut status = ConfigRequestStatus {
            desired_version: Some(desired.clone()),
            published_version: published_version.clone(),
            cache_state: Some(cache_state),
            revisions: history
                .iter()
                .map(|r| RevisionRef {
                    version: r.version().to_string(),
                    revision: r.key(),
                })
                .collect(),
            conditions: request.status.conditions.clone(),
        };
        match cache_state {
            CacheState::InSync => {
                status
                    .conditions
                    .set(ConditionType::CacheOutOfSync, false, reasons::IN_SYNC, "", now);
                status
                    .conditions
                    .set(ConditionType::RollbackFailed, false, reasons::IN_SYNC, "", now);
            }
            CacheState::Rollback => {
                let message = format!(
                    "serving version {} instead of desired {}",
                    published_version.as_deref().unwrap_or_default(),
                    desired
                );
                status
                    .conditions
                    .set(ConditionType::CacheOutOfSync, true, reasons::ROLLBACK, &message, now);
                status
                    .conditions
                    .set(ConditionType::RollbackFailed, false, reasons::ROLLBACK, "", now);
            }
            CacheState::RollbackFailed => {
                let message = "every revision is tainted";
                status.conditions.set(
                    ConditionType::CacheOutOfSync,
                    true,
                    reasons::ROLLBACK_FAILED,
                    message,
                    now,
                );
                status.conditions.set(
                    ConditionType::RollbackFailed,
                    true,
                    reasons::ROLLBACK_FAILED,
                    message,
                    now,
                );
            }
        }

        if status != request.status {
            if request.status.cache_state != Some(cache_state) {
                match cache_state {
                    CacheState::InSync => {
                        tracing::info!(request = %key, version = %desired, "request in sync")
                    }
                    CacheState::Rollback => tracing::warn!(
                        request = %key,
                        desired = %desired,
                        published = published_version.as_deref().unwrap_or_default(),
                        "rolled back to an earlier revision"
                    ),
                    CacheState::RollbackFailed => {
                        tracing::error!(request = %key, "no untainted revision left to publish")
                    }
                }
            }
            let mut updated = request;
            updated.status = status;
            self.requests.update_status(updated).await?;
        }
        self.record_state(key, cache_state);

        Ok(ReconcileOutcome::Done)
    }
}
