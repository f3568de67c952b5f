//! Object storage.
//!
//! - [`object`] - `ObjectStore` trait and change events
//! - [`memory`] - In-memory store with a label index
//! - [`revisions`] - Revision Store: typed lookups, priority order, status patches
//! - [`secrets`] - Secret material for generated `secret` resources
//! - [`manifest`] - Manifest directory loader

pub mod manifest;
pub mod memory;
pub mod object;
pub mod revisions;
pub mod secrets;

pub use memory::MemoryStore;
pub use object::{Object, ObjectStore, SharedStore, WatchEvent};
pub use revisions::{
    apply_status_changes, select_publish_target, sort_by_priority, PublicationPriority,
    RevisionFilter, RevisionStore, StatusChange,
};
pub use secrets::{MemorySecretStore, SecretData, SecretError, SecretStore, SharedSecretStore};
