//! Revision Store.
//!
//! Typed access to `ConfigRevision` records over an [`ObjectStore`]:
//! label-filtered listing, exactly-one lookups, the publication-priority
//! order, and the single status-update path used by every component that
//! touches revision status.
//!
//! # Status updates
//!
//! The request reconciler, the revision reconciler and the rejection handler
//! all mutate revision status. None of them read-modify-write directly;
//! they describe the change as a list of [`StatusChange`]s and
//! [`RevisionStore::patch_status`] applies it against the stored record with
//! compare-and-set, re-reading on conflict.

use super::object::{Object, ObjectStore, SharedStore};
use crate::api::{
    ApiVersion, ConditionType, ConfigRevision, ConfigRevisionStatus, LabelSelector, ObjectKey,
    LABEL_API_VERSION, LABEL_NODE_ID, LABEL_VERSION,
};
use crate::core::error::{TesseraError, TesseraResult};
use crate::core::time::SharedClock;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

const KIND: &str = "ConfigRevision";

/// Conflict re-reads inside one `patch_status` call.
const PATCH_ATTEMPTS: usize = 3;

/// Condition reasons written by the status-update path.
pub mod reasons {
    pub const PUBLISHED: &str = "Published";
    pub const SUPERSEDED: &str = "Superseded";
    pub const SYNCED: &str = "Synced";
    pub const INVALID_RESOURCES: &str = "InvalidResources";
    pub const SECRET_UNAVAILABLE: &str = "SecretUnavailable";
    pub const CLIENT_REJECTED: &str = "ClientRejected";
}

/// Label filter over revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionFilter {
    pub namespace: Option<String>,
    pub node_id: String,
    pub version: Option<String>,
    pub api_version: Option<ApiVersion>,
}

impl RevisionFilter {
    /// All revisions of a node for one API version.
    pub fn node(node_id: impl Into<String>, api_version: ApiVersion) -> Self {
        Self {
            namespace: None,
            node_id: node_id.into(),
            version: None,
            api_version: Some(api_version),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Label selector equivalent of this filter.
    pub fn selector(&self) -> LabelSelector {
        let mut selector = LabelSelector::default().with(LABEL_NODE_ID, self.node_id.clone());
        if let Some(version) = &self.version {
            selector = selector.with(LABEL_VERSION, version.clone());
        }
        if let Some(api) = self.api_version {
            selector = selector.with(LABEL_API_VERSION, api.as_str());
        }
        selector
    }
}

impl std::fmt::Display for RevisionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} in {}", self.selector(), ns),
            None => write!(f, "{}", self.selector()),
        }
    }
}

/// A proposed change to revision status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// Mark published; stamps `lastPublishedAt` on the transition.
    Publish,
    /// Clear the published flag.
    Unpublish,
    /// Mark tainted. Sticky: a tainted revision keeps its first reason.
    Taint { reason: String, message: String },
    /// Resources are materialized in the snapshot cache.
    ResourcesInSync,
    /// Resources could not be materialized.
    ResourcesOutOfSync { reason: String, message: String },
}

impl StatusChange {
    pub fn taint(reason: &str, message: impl Into<String>) -> Self {
        Self::Taint {
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn out_of_sync(reason: &str, message: impl Into<String>) -> Self {
        Self::ResourcesOutOfSync {
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Apply changes to a status in place. Returns true if anything changed.
///
/// The `published` and `tainted` flags always mirror their conditions.
pub fn apply_status_changes(
    status: &mut ConfigRevisionStatus,
    changes: &[StatusChange],
    now: DateTime<Utc>,
) -> bool {
    let mut changed = false;
    for change in changes {
        changed |= match change {
            StatusChange::Publish => {
                let was_published = status.conditions.is_true(ConditionType::RevisionPublished);
                let mut c = status.conditions.set(
                    ConditionType::RevisionPublished,
                    true,
                    reasons::PUBLISHED,
                    "",
                    now,
                );
                if !was_published {
                    status.last_published_at = Some(now);
                    c = true;
                }
                c | set_flag(&mut status.published, true)
            }
            StatusChange::Unpublish => {
                let was_published = status.conditions.is_true(ConditionType::RevisionPublished);
                let c = was_published
                    && status.conditions.set(
                        ConditionType::RevisionPublished,
                        false,
                        reasons::SUPERSEDED,
                        "",
                        now,
                    );
                c | set_flag(&mut status.published, false)
            }
            StatusChange::Taint { reason, message } => {
                if status.conditions.is_true(ConditionType::RevisionTainted) {
                    set_flag(&mut status.tainted, true)
                } else {
                    status.conditions.set(
                        ConditionType::RevisionTainted,
                        true,
                        reason,
                        message,
                        now,
                    ) | set_flag(&mut status.tainted, true)
                }
            }
            StatusChange::ResourcesInSync => status.conditions.set(
                ConditionType::ResourcesInSync,
                true,
                reasons::SYNCED,
                "",
                now,
            ),
            StatusChange::ResourcesOutOfSync { reason, message } => status.conditions.set(
                ConditionType::ResourcesInSync,
                false,
                reason,
                message,
                now,
            ),
        };
    }
    changed
}

fn set_flag(flag: &mut bool, value: bool) -> bool {
    let changed = *flag != value;
    *flag = value;
    changed
}

/// Publication priority of a revision; higher publishes first.
///
/// The desired revision outranks everything. The rest rank by last
/// activity: last publication if ever published, else creation. The name
/// breaks ties so the order is total.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PublicationPriority {
    pub is_desired: bool,
    pub last_activity: DateTime<Utc>,
    pub name: String,
}

impl PublicationPriority {
    pub fn of(revision: &ConfigRevision, desired_version: &str) -> Self {
        Self {
            is_desired: revision.version() == desired_version,
            last_activity: revision.last_activity(),
            name: revision.metadata.name.clone(),
        }
    }
}

/// Sort revisions in publication-priority order, lowest first.
pub fn sort_by_priority(revisions: &mut [ConfigRevision], desired_version: &str) {
    revisions.sort_by(|a, b| compare_priority(a, b, desired_version));
}

fn compare_priority(a: &ConfigRevision, b: &ConfigRevision, desired_version: &str) -> Ordering {
    PublicationPriority::of(a, desired_version).cmp(&PublicationPriority::of(b, desired_version))
}

/// The untainted revision with the highest priority, if any.
pub fn select_publish_target<'a>(
    revisions: &'a [ConfigRevision],
    desired_version: &str,
) -> Option<&'a ConfigRevision> {
    revisions
        .iter()
        .filter(|r| !r.is_tainted())
        .max_by(|a, b| compare_priority(a, b, desired_version))
}

/// Typed revision access.
#[derive(Clone)]
pub struct RevisionStore {
    store: SharedStore<ConfigRevision>,
    clock: SharedClock,
}

impl RevisionStore {
    pub fn new(store: SharedStore<ConfigRevision>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Underlying object store.
    pub fn objects(&self) -> &SharedStore<ConfigRevision> {
        &self.store
    }

    pub async fn create(&self, revision: ConfigRevision) -> TesseraResult<ConfigRevision> {
        self.store.create(revision).await
    }

    pub async fn get(&self, key: &ObjectKey) -> TesseraResult<ConfigRevision> {
        self.store.get(key).await
    }

    pub async fn delete(&self, key: &ObjectKey) -> TesseraResult<()> {
        self.store.delete(key).await
    }

    /// Revisions matching a filter, in store order.
    pub async fn list(&self, filter: &RevisionFilter) -> TesseraResult<Vec<ConfigRevision>> {
        self.store
            .list(filter.namespace.as_deref(), &filter.selector())
            .await
    }

    /// Revisions owned by a request.
    pub async fn list_owned_by(&self, owner: &ObjectKey) -> TesseraResult<Vec<ConfigRevision>> {
        let all = self
            .store
            .list(Some(&owner.namespace), &LabelSelector::everything())
            .await?;
        Ok(all
            .into_iter()
            .filter(|r| r.metadata.owner.as_ref() == Some(owner))
            .collect())
    }

    /// At most one match. More than one is a data-integrity error.
    pub async fn find_one(&self, filter: &RevisionFilter) -> TesseraResult<Option<ConfigRevision>> {
        let mut matches = self.list(filter).await?;
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(TesseraError::ambiguous(KIND, filter, count)),
        }
    }

    /// Exactly one match. Zero or several is a data-integrity error.
    pub async fn get_exactly_one(&self, filter: &RevisionFilter) -> TesseraResult<ConfigRevision> {
        let mut matches = self.list(filter).await?;
        if matches.len() != 1 {
            return Err(TesseraError::ambiguous(KIND, filter, matches.len()));
        }
        matches
            .pop()
            .ok_or_else(|| TesseraError::ambiguous(KIND, filter, 0))
    }

    /// Restore lookup labels that drifted from the spec.
    ///
    /// Returns the stored revision, rewritten only if labels differed.
    pub async fn repair_labels(&self, revision: ConfigRevision) -> TesseraResult<ConfigRevision> {
        let expected = revision.expected_labels();
        let missing = expected
            .iter()
            .any(|(k, v)| revision.metadata.labels.get(k) != Some(v));
        if !missing {
            return Ok(revision);
        }

        let mut repaired = revision;
        repaired.metadata.labels.extend(expected);
        tracing::info!(revision = %repaired.key(), "restoring revision labels");
        self.store.update(repaired).await
    }

    /// Apply status changes with compare-and-set.
    ///
    /// Nothing is written when the changes are already in effect. A conflict
    /// re-reads the record and re-applies the changes; after a few attempts
    /// the conflict is returned so the caller's requeue takes over.
    pub async fn patch_status(
        &self,
        key: &ObjectKey,
        changes: &[StatusChange],
    ) -> TesseraResult<ConfigRevision> {
        let mut last_conflict = None;
        for _ in 0..PATCH_ATTEMPTS {
            let stored = self.store.get(key).await?;
            let mut next = stored.clone();
            if !apply_status_changes(&mut next.status, changes, self.clock.now()) {
                return Ok(stored);
            }
            match self.store.update_status(next).await {
                Ok(updated) => return Ok(updated),
                Err(err) if err.is_conflict() => {
                    tracing::debug!(revision = %key, error = %err, "status patch conflict, re-reading");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_conflict.unwrap_or_else(|| TesseraError::internal("status patch exhausted")))
    }
}
