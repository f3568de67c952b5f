//! Discovery protocol.
//!
//! Serves per-node snapshots over the aggregated discovery stream and turns
//! client rejections into revision taints.

pub mod node;
pub mod proto;
pub mod rejection;
pub mod server;
pub mod stream;

pub use node::{IdHash, NodeHash, UNKNOWN_NODE};
pub use rejection::{Rejection, RejectionHandler, TaintOnRejection};
pub use server::{
    AdsServer, DiscoveryServer, DiscoveryService, TlsMaterial, ADS_SERVICE, ADS_STREAM_PATH,
};
pub use stream::{DiscoveryStream, StreamContext};
