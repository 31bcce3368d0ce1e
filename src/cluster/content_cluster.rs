// src/cluster/content_cluster.rs

//! Authoritative registry of the content cluster.
//!
//! Holds the configured node set, one `NodeInfo` per configured node and the
//! frozen group tree. It is owned by the controller's event loop; every other
//! reader works on snapshots.

use std::collections::BTreeMap;
use tracing::info;
use crate::common::error::{ControllerError, Result};
use super::checker::{CheckResult, Condition, NodeStateChangeChecker};
use super::config::{BucketSpaceConfig, ConfiguredNode, ControllerConfig};
use super::group::Group;
use super::node::{Node, NodeInfo, NodeState};
use super::state::ClusterState;

/// The content cluster managed by this controller
#[derive(Debug, Clone)]
pub struct ContentCluster {
    name: String,
    configured_nodes: BTreeMap<u16, ConfiguredNode>,
    node_infos: BTreeMap<Node, NodeInfo>,
    groups: Group,
    bucket_spaces: Vec<BucketSpaceConfig>,
    min_storage_up_count: usize,
    min_distributor_up_count: usize,
}

impl ContentCluster {
    /// Build the registry from a validated configuration
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        config.validate()?;
        let groups = config.build_groups()?;
        let mut cluster = Self {
            name: config.cluster_name.clone(),
            configured_nodes: BTreeMap::new(),
            node_infos: BTreeMap::new(),
            groups,
            bucket_spaces: config.bucket_spaces.clone(),
            min_storage_up_count: config.min_storage_up_count,
            min_distributor_up_count: config.min_distributor_up_count,
        };
        cluster.apply_configured_nodes(&config.nodes);
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up the record of a configured node
    pub fn get_node_info(&self, node: Node) -> Result<&NodeInfo> {
        self.node_infos.get(&node).ok_or_else(|| self.unknown_node(node))
    }

    pub(crate) fn get_node_info_mut(&mut self, node: Node) -> Result<&mut NodeInfo> {
        self.node_infos.get_mut(&node).ok_or_else(|| {
            ControllerError::NotFound(format!("Unknown node {} in cluster '{}'", node, self.name))
        })
    }

    fn unknown_node(&self, node: Node) -> ControllerError {
        ControllerError::NotFound(format!("Unknown node {} in cluster '{}'", node, self.name))
    }

    pub fn has_configured_node(&self, index: u16) -> bool {
        self.configured_nodes.contains_key(&index)
    }

    /// Configured nodes ordered by index
    pub fn get_configured_nodes(&self) -> &BTreeMap<u16, ConfiguredNode> {
        &self.configured_nodes
    }

    pub fn node_infos(&self) -> impl Iterator<Item = &NodeInfo> {
        self.node_infos.values()
    }

    pub fn groups(&self) -> &Group {
        &self.groups
    }

    /// The leaf group holding the storage node with this index
    pub fn leaf_group(&self, index: u16) -> Option<&Group> {
        self.groups.leaf_index().get(&index).copied()
    }

    pub fn bucket_spaces(&self) -> &[BucketSpaceConfig] {
        &self.bucket_spaces
    }

    pub fn min_storage_up_count(&self) -> usize {
        self.min_storage_up_count
    }

    pub fn min_distributor_up_count(&self) -> usize {
        self.min_distributor_up_count
    }

    /// Evaluate a proposed wanted state change against the given published state.
    ///
    /// This is the only way callers reach the safety checker.
    pub fn calculate_effect_of_new_state(
        &self,
        node: Node,
        current_state: &ClusterState,
        condition: Condition,
        old_wanted: &NodeState,
        new_wanted: &NodeState,
        in_master_moratorium: bool,
    ) -> Result<CheckResult> {
        NodeStateChangeChecker::new(self).evaluate_transition(
            node,
            current_state,
            condition,
            old_wanted,
            new_wanted,
            in_master_moratorium,
        )
    }

    /// Record a state reported by the node itself
    pub(crate) fn report_state(
        &mut self,
        node: Node,
        state: NodeState,
        host_metrics: Option<serde_json::Value>,
    ) -> Result<()> {
        state.validate_for(node.node_type)?;
        self.get_node_info_mut(node)?.set_reported_state(state, host_metrics);
        Ok(())
    }

    /// Apply a new topology. Nodes that stay configured keep their reported and
    /// wanted states, new nodes start unreported, removed nodes are dropped.
    pub fn reload(&mut self, config: &ControllerConfig) -> Result<()> {
        config.validate()?;
        if config.cluster_name != self.name {
            return Err(ControllerError::InvalidInput(format!(
                "Topology is for cluster '{}', this controller manages '{}'",
                config.cluster_name, self.name
            )));
        }
        self.groups = config.build_groups()?;
        self.bucket_spaces = config.bucket_spaces.clone();
        self.min_storage_up_count = config.min_storage_up_count;
        self.min_distributor_up_count = config.min_distributor_up_count;
        self.apply_configured_nodes(&config.nodes);
        Ok(())
    }

    fn apply_configured_nodes(&mut self, nodes: &[ConfiguredNode]) {
        let configured: BTreeMap<u16, ConfiguredNode> = nodes.iter().map(|n| (n.index, *n)).collect();

        let removed: Vec<Node> = self
            .node_infos
            .keys()
            .filter(|node| !configured.contains_key(&node.index))
            .copied()
            .collect();
        for node in removed {
            info!(cluster = %self.name, %node, "Node is no longer configured");
            self.node_infos.remove(&node);
        }

        let leaves: BTreeMap<u16, String> = self
            .groups
            .leaf_index()
            .into_iter()
            .map(|(index, group)| (index, group.path().to_string()))
            .collect();

        for configured_node in configured.values() {
            let index = configured_node.index;
            for node in [Node::distributor(index), Node::storage(index)] {
                let group = if node.is_storage() { leaves.get(&index).cloned() } else { None };
                let retired = node.is_storage() && configured_node.retired;
                match self.node_infos.get_mut(&node) {
                    Some(existing) => {
                        existing.set_group(group);
                        existing.set_configured_retired(retired);
                    }
                    None => {
                        if !self.configured_nodes.is_empty() {
                            info!(cluster = %self.name, %node, "Node added to configuration");
                        }
                        self.node_infos.insert(node, NodeInfo::new(node, group, retired));
                    }
                }
            }
        }

        self.configured_nodes = configured;
    }
}
