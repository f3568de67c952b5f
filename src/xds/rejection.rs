//! Client rejections.
//!
//! A NACK names the revision whose snapshot the client refused. The handler
//! only marks that revision tainted; the request reconciler notices the taint
//! through its revision watch and picks the next publishable revision.

use crate::api::ApiVersion;
use crate::core::error::TesseraResult;
use crate::ops::observability::SharedMetrics;
use crate::store::object::Object;
use crate::store::revisions::{reasons, RevisionFilter, RevisionStore, StatusChange};
use async_trait::async_trait;

/// A NACK, resolved to the revision that produced the rejected response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub node_id: String,
    /// Namespace of the rejected revision, when the stream knows it.
    pub namespace: Option<String>,
    /// Content version of the revision.
    pub version: String,
    pub api_version: ApiVersion,
    pub type_url: String,
    pub message: String,
}

/// Called once per NACK, off the stream task.
#[async_trait]
pub trait RejectionHandler: Send + Sync + 'static {
    async fn on_rejection(&self, rejection: Rejection);
}

/// Taints the rejected revision.
pub struct TaintOnRejection {
    revisions: RevisionStore,
    metrics: SharedMetrics,
}

impl TaintOnRejection {
    pub fn new(revisions: RevisionStore, metrics: SharedMetrics) -> Self {
        Self { revisions, metrics }
    }

    /// Returns true when the revision was newly tainted.
    pub async fn taint(&self, rejection: &Rejection) -> TesseraResult<bool> {
        let mut filter = RevisionFilter::node(rejection.node_id.clone(), rejection.api_version)
            .with_version(rejection.version.clone());
        if let Some(namespace) = &rejection.namespace {
            filter = filter.in_namespace(namespace.clone());
        }
        let revision = self.revisions.get_exactly_one(&filter).await?;
        if revision.is_tainted() {
            return Ok(false);
        }

        let message = format!("{}: {}", rejection.type_url, rejection.message);
        let patched = self
            .revisions
            .patch_status(
                &revision.key(),
                &[StatusChange::taint(reasons::CLIENT_REJECTED, message)],
            )
            .await?;
        Ok(patched.status != revision.status)
    }
}

#[async_trait]
impl RejectionHandler for TaintOnRejection {
    async fn on_rejection(&self, rejection: Rejection) {
        match self.taint(&rejection).await {
            Ok(true) => {
                self.metrics.record_taint(reasons::CLIENT_REJECTED);
                tracing::warn!(
                    node_id = %rejection.node_id,
                    version = %rejection.version,
                    type_url = %rejection.type_url,
                    reason = %rejection.message,
                    "client rejected revision, tainted"
                );
            }
            Ok(false) => {
                tracing::debug!(
                    node_id = %rejection.node_id,
                    version = %rejection.version,
                    "rejected revision already tainted"
                );
            }
            Err(err) => {
                tracing::error!(
                    node_id = %rejection.node_id,
                    version = %rejection.version,
                    error = %err,
                    "failed to taint rejected revision"
                );
            }
        }
    }
}
