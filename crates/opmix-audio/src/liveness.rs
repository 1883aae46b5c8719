//! Per-frame heartbeat set.
//!
//! Every orchestrator call marks its node; `OperatorPlayback::complete_frame`
//! reads the set once, then clears it for the next frame.

use opmix_core::NodeId;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct LivenessSet {
    seen: HashSet<NodeId>,
    frame: u64,
}

impl LivenessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat. Returns `false` if the node already called this frame.
    pub fn mark(&mut self, id: NodeId) -> bool {
        self.seen.insert(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.seen.contains(id)
    }

    /// End the frame.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.frame += 1;
    }

    /// Frames completed so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
