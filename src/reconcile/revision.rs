//! Revision reconciler.
//!
//! Keeps the snapshot cache in line with published revisions. A published,
//! untainted revision is built and served; a revision that fails to decode
//! is tainted so the request reconciler rolls back on its next pass.
//!
//! Builds can overlap with publication changes. A finished build is only
//! swapped in if its revision is still published when the build completes,
//! and an unpublished revision still being served hands the node back to
//! whichever revision is published now.

use super::controller::{ReconcileOutcome, Reconciler};
use crate::api::{ConfigRevision, ObjectKey};
use crate::cache::builder::CacheBuilder;
use crate::core::error::{TesseraError, TesseraResult};
use crate::ops::observability::SharedMetrics;
use crate::store::revisions::{reasons, RevisionFilter, RevisionStore, StatusChange};
use async_trait::async_trait;

/// Reconciles `ConfigRevision` objects.
pub struct RevisionReconciler {
    revisions: RevisionStore,
    builder: CacheBuilder,
    metrics: SharedMetrics,
}

impl RevisionReconciler {
    pub fn new(revisions: RevisionStore, builder: CacheBuilder, metrics: SharedMetrics) -> Self {
        Self {
            revisions,
            builder,
            metrics,
        }
    }

    /// The revision currently published for the same node, other than `revision`.
    async fn published_replacement(
        &self,
        revision: &ConfigRevision,
    ) -> TesseraResult<Option<ConfigRevision>> {
        let filter = RevisionFilter::node(revision.spec.node_id.clone(), revision.spec.api_version)
            .in_namespace(revision.metadata.namespace.clone());
        let key = revision.metadata.key();
        Ok(self
            .revisions
            .list(&filter)
            .await?
            .into_iter()
            .find(|r| r.metadata.key() != key && r.is_published() && !r.is_tainted()))
    }

    /// An unpublished revision must not stay in the cache. If the node is
    /// still served from it, rebuild the node from its published revision,
    /// or serve nothing when there is none.
    async fn withdraw(&self, revision: &ConfigRevision) -> TesseraResult<ReconcileOutcome> {
        let key = revision.metadata.key();
        let serving = self
            .builder
            .cache()
            .get(&revision.spec.node_id)
            .is_some_and(|current| current.revision.key == key);
        if !serving {
            return Ok(ReconcileOutcome::Done);
        }

        match self.published_replacement(revision).await? {
            Some(replacement) => {
                let replacement_key = replacement.metadata.key();
                tracing::info!(
                    revision = %key,
                    replacement = %replacement_key,
                    "unpublished revision still served, rebuilding from the published one"
                );
                self.builder.cache().remove_by_revision(&key);
                self.reconcile(&replacement_key).await
            }
            None => {
                self.builder.cache().remove_by_revision(&key);
                Ok(ReconcileOutcome::Done)
            }
        }
    }
}

#[async_trait]
impl Reconciler for RevisionReconciler {
    fn name(&self) -> &'static str {
        "revision"
    }

    async fn reconcile(&self, key: &ObjectKey) -> TesseraResult<ReconcileOutcome> {
        let revision = match self.revisions.get(key).await {
            Ok(revision) => revision,
            Err(err) if err.is_not_found() => {
                for node in self.builder.cache().remove_by_revision(key) {
                    tracing::info!(revision = %key, node_id = %node, "revision deleted, snapshot dropped");
                }
                return Ok(ReconcileOutcome::Done);
            }
            Err(err) => return Err(err),
        };
        let revision = self.revisions.repair_labels(revision).await?;

        if !revision.is_published() {
            return self.withdraw(&revision).await;
        }
        if revision.is_tainted() {
            return Ok(ReconcileOutcome::Done);
        }

        let built = match self.builder.snapshot_for(&revision).await {
            Ok(snapshot) => {
                // Publication may have moved while the build ran.
                let current = match self.revisions.get(key).await {
                    Ok(current) => current,
                    Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::Done),
                    Err(err) => return Err(err),
                };
                if !current.is_published() {
                    tracing::debug!(revision = %key, "revision unpublished during build, discarding snapshot");
                    return self.withdraw(&current).await;
                }
                if current.is_tainted() {
                    return Ok(ReconcileOutcome::Done);
                }
                Ok(self.builder.publish(snapshot))
            }
            Err(err) => Err(err),
        };

        match built {
            Ok(outcome) => {
                if outcome.updated {
                    tracing::debug!(revision = %key, versions = ?outcome.versions, "revision materialized");
                }
                self.revisions
                    .patch_status(key, &[StatusChange::ResourcesInSync])
                    .await?;
                Ok(ReconcileOutcome::Done)
            }
            Err(err) if err.is_permanent() => {
                let message = err.to_string();
                tracing::warn!(revision = %key, error = %message, "revision content is invalid, tainting");
                let patched = self
                    .revisions
                    .patch_status(
                        key,
                        &[
                            StatusChange::taint(reasons::INVALID_RESOURCES, message.clone()),
                            StatusChange::out_of_sync(reasons::INVALID_RESOURCES, message),
                        ],
                    )
                    .await?;
                if patched.status != revision.status {
                    self.metrics.record_taint(reasons::INVALID_RESOURCES);
                }
                Ok(ReconcileOutcome::Done)
            }
            Err(err) => {
                let message = err.to_string();
                self.revisions
                    .patch_status(
                        key,
                        &[StatusChange::out_of_sync(reasons::SECRET_UNAVAILABLE, message)],
                    )
                    .await?;
                Err(TesseraError::from(err))
            }
        }
    }
}
