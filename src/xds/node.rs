//! Node identity.

use super::proto::Node;

/// Snapshot cache key for streams that never declare a usable node.
pub const UNKNOWN_NODE: &str = "unknown";

/// Maps a client's declared node to its snapshot cache key.
pub trait NodeHash: Send + Sync + 'static {
    fn id(&self, node: Option<&Node>) -> String;
}

/// Keys snapshots by `Node.id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdHash;

impl NodeHash for IdHash {
    fn id(&self, node: Option<&Node>) -> String {
        match node {
            Some(node) if !node.id.is_empty() => node.id.clone(),
            _ => UNKNOWN_NODE.to_string(),
        }
    }
}
