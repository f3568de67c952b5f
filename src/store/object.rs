//! Versioned object store interface.
//!
//! The reconcilers only see this trait. Label selectors are the sole indexed
//! access path; every write is compare-and-set on `resource_version`.

use crate::api::{ConfigRequest, ConfigRequestSpec, ConfigRequestStatus};
use crate::api::{ConfigRevision, ConfigRevisionSpec, ConfigRevisionStatus};
use crate::api::{LabelSelector, ObjectKey, ObjectMeta};
use crate::core::error::TesseraResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A record kind that can live in an [`ObjectStore`].
pub trait Object: Clone + Send + Sync + std::fmt::Debug + 'static {
    type Spec: Clone + PartialEq + Send + Sync;
    type Status: Clone + PartialEq + Send + Sync;

    /// Kind name used in errors and logs.
    const KIND: &'static str;

    /// Whether the spec is frozen after creation.
    const IMMUTABLE_SPEC: bool = false;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn spec(&self) -> &Self::Spec;
    fn spec_mut(&mut self) -> &mut Self::Spec;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

impl Object for ConfigRequest {
    type Spec = ConfigRequestSpec;
    type Status = ConfigRequestStatus;
    const KIND: &'static str = "ConfigRequest";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut Self::Spec {
        &mut self.spec
    }
    fn status(&self) -> &Self::Status {
        &self.status
    }
    fn status_mut(&mut self) -> &mut Self::Status {
        &mut self.status
    }
}

impl Object for ConfigRevision {
    type Spec = ConfigRevisionSpec;
    type Status = ConfigRevisionStatus;
    const KIND: &'static str = "ConfigRevision";
    const IMMUTABLE_SPEC: bool = true;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut Self::Spec {
        &mut self.spec
    }
    fn status(&self) -> &Self::Status {
        &self.status
    }
    fn status_mut(&mut self) -> &mut Self::Status {
        &mut self.status
    }
}

/// Change notification.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T: Object> WatchEvent<T> {
    /// The object the event refers to.
    pub fn object(&self) -> &T {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o,
        }
    }
}

/// Versioned storage for one record kind.
#[async_trait]
pub trait ObjectStore<T: Object>: Send + Sync {
    /// Store a new object. Fails with `AlreadyExists` if the key is taken.
    async fn create(&self, object: T) -> TesseraResult<T>;

    /// Fetch one object.
    async fn get(&self, key: &ObjectKey) -> TesseraResult<T>;

    /// List objects matching `selector`, optionally restricted to one namespace.
    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector)
        -> TesseraResult<Vec<T>>;

    /// Replace spec and labels. Compare-and-set on `resource_version`.
    async fn update(&self, object: T) -> TesseraResult<T>;

    /// Replace status only. Compare-and-set on `resource_version`.
    async fn update_status(&self, object: T) -> TesseraResult<T>;

    /// Remove an object.
    async fn delete(&self, key: &ObjectKey) -> TesseraResult<()>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

/// Shared handle to a store.
pub type SharedStore<T> = Arc<dyn ObjectStore<T>>;
