//! Stable node identities.
//!
//! Graph nodes are identified by the path of instance ids from the graph
//! root down to the node. Hashing that path (UUID v5) gives an identity
//! that survives re-evaluation and hot reload, unlike a random id.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for all OpMix node identities.
const NODE_NAMESPACE: Uuid = Uuid::from_u128(0x6f70_6d69_785f_6e6f_6465_5f69_6473_0001);

/// A stable 128-bit identity for an operator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Derive an identity from the node's structural path.
    ///
    /// Each segment is folded into the previous digest, so `["a", "b"]` and
    /// `["ab"]` produce different ids.
    pub fn from_path<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let id = segments
            .into_iter()
            .fold(NODE_NAMESPACE, |parent, segment| {
                Uuid::new_v5(&parent, segment.as_ref())
            });
        Self(id)
    }

    /// Derive an identity from a path of instance UUIDs.
    pub fn from_instance_path(path: &[Uuid]) -> Self {
        Self::from_path(path.iter().map(|id| id.as_bytes().to_vec()))
    }

    /// Wrap an existing UUID without hashing.
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}
