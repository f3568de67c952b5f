//! Record types.
//!
//! - [`meta`] - Object metadata, keys, labels and selectors
//! - [`resources`] - Resource declarations and the closed resource-type union
//! - [`conditions`] - Status conditions
//! - [`request`] - `ConfigRequest`, the desired state for one node
//! - [`revision`] - `ConfigRevision`, one immutable content version

pub mod conditions;
pub mod meta;
pub mod request;
pub mod resources;
pub mod revision;

pub use conditions::{Condition, ConditionType, Conditions};
pub use meta::{
    LabelSelector, ObjectKey, ObjectMeta, DEFAULT_NAMESPACE, LABEL_API_VERSION, LABEL_NODE_ID,
    LABEL_VERSION,
};
pub use request::{CacheState, ConfigRequest, ConfigRequestSpec, ConfigRequestStatus, RevisionRef};
pub use resources::{
    ApiVersion, Blueprint, LegacyEntry, LegacyResources, LegacySecret, OpaqueSecretRef,
    ResourceEntry, ResourceSource, ResourceType, SerializationFormat, TlsSecretRef,
};
pub use revision::{ConfigRevision, ConfigRevisionSpec, ConfigRevisionStatus};
