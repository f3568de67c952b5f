//! Reconciliation.
//!
//! Two controllers run side by side. The request controller turns each
//! `ConfigRequest` into revisions and picks the one to publish; the revision
//! controller materializes published revisions into the snapshot cache.

pub mod controller;
pub mod queue;
pub mod request;
pub mod revision;

pub use controller::{
    enqueue_all, own_key, owner_key, spawn_resync, spawn_secret_watch, spawn_watch, Controller,
    ControllerSettings, KeyFn, ReconcileOutcome, Reconciler,
};
pub use queue::WorkQueue;
pub use request::{RequestReconciler, DEFAULT_MAX_REVISIONS};
pub use revision::RevisionReconciler;
