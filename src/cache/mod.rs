//! Snapshot materialization.
//!
//! - [`hash`] - Canonical content hashing
//! - [`decode`] - Raw value decoders per serialization format
//! - [`resource`] - Typed resource union
//! - [`snapshot`] - Per-node snapshots and slot versions
//! - [`snapshot_cache`] - Served snapshots, one per node
//! - [`builder`] - Cache Builder

pub mod builder;
pub mod decode;
pub mod hash;
pub mod resource;
pub mod snapshot;
pub mod snapshot_cache;

pub use builder::{BuildOutcome, CacheBuilder, CacheError};
pub use decode::{Decoder, DecoderRegistry};
pub use hash::{content_hash, resources_hash, resources_hash_with};
pub use resource::Resource;
pub use snapshot::{RevisionTag, Slot, Snapshot, VersionTracker};
pub use snapshot_cache::{SnapshotCache, SnapshotReceiver};
