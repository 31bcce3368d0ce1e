// src/controller/ack.rs

//! Cluster state version acknowledgements.

use std::collections::HashMap;
use crate::cluster::{ClusterStateBundle, Node};

/// Highest cluster state version acknowledged by each node
#[derive(Debug, Default)]
pub struct VersionAckTracker {
    acked: HashMap<Node, u64>,
}

impl VersionAckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acknowledgement; older versions never replace newer ones
    pub fn record(&mut self, node: Node, version: u64) {
        let entry = self.acked.entry(node).or_insert(0);
        *entry = (*entry).max(version);
    }

    pub fn acked_version(&self, node: Node) -> Option<u64> {
        self.acked.get(&node).copied()
    }

    /// Nodes of the published bundle that still have to acknowledge `version`.
    ///
    /// Only nodes that are up, initializing or retired in the baseline take part.
    pub fn pending_nodes(&self, version: u64, published: &ClusterStateBundle) -> Vec<Node> {
        published
            .baseline()
            .nodes()
            .filter(|(_, state)| state.state.expects_state_acks())
            .map(|(node, _)| *node)
            .filter(|node| self.acked.get(node).copied().unwrap_or(0) < version)
            .collect()
    }

    pub fn is_acked(&self, version: u64, published: &ClusterStateBundle) -> bool {
        self.pending_nodes(version, published).is_empty()
    }

    /// Forget nodes that are no longer configured
    pub fn retain(&mut self, keep: impl Fn(&Node) -> bool) {
        self.acked.retain(|node, _| keep(node));
    }
}
