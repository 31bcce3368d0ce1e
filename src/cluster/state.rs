// src/cluster/state.rs

//! Versioned cluster states.
//!
//! A cluster state is derived from every node's reported and wanted state and
//! is never mutated once built. A bundle holds the baseline state plus one
//! derived state per bucket space, all sharing a single version.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use serde::Serialize;
use super::config::BucketSpaceConfig;
use super::content_cluster::ContentCluster;
use super::node::{Node, NodeInfo, NodeState, NodeType, State};

/// Snapshot of every node's published state at one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterState {
    version: u64,
    cluster_up: bool,
    nodes: BTreeMap<Node, NodeState>,
}

impl ClusterState {
    /// The well-defined state of a cluster without nodes: down, version 0
    pub fn empty() -> Self {
        Self {
            version: 0,
            cluster_up: false,
            nodes: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_cluster_up(&self) -> bool {
        self.cluster_up
    }

    pub fn node_state(&self, node: Node) -> Option<&NodeState> {
        self.nodes.get(&node)
    }

    /// State code of a node; nodes absent from the state are down
    pub fn state_of(&self, node: Node) -> State {
        self.nodes.get(&node).map(|s| s.state).unwrap_or(State::Down)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&Node, &NodeState)> {
        self.nodes.iter()
    }

    fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    fn node_count(&self, node_type: NodeType) -> u32 {
        self.nodes
            .keys()
            .filter(|node| node.node_type == node_type)
            .map(|node| node.index as u32 + 1)
            .max()
            .unwrap_or(0)
    }

    /// Compact text form, e.g. `version:3 distributor:3 storage:3 .2.s:m`.
    ///
    /// Up nodes without partition problems are left out; index gaps are down.
    pub fn to_state_string(&self, include_version: bool) -> String {
        let mut parts = Vec::new();
        if include_version {
            parts.push(format!("version:{}", self.version));
        }
        if !self.cluster_up {
            parts.push("cluster:d".to_string());
        }
        for node_type in [NodeType::Distributor, NodeType::Storage] {
            let count = self.node_count(node_type);
            if count == 0 {
                continue;
            }
            parts.push(format!("{}:{}", node_type, count));
            for index in 0..count {
                let node = Node::new(node_type, index as u16);
                let Some(state) = self.nodes.get(&node) else {
                    parts.push(format!(".{}.s:d", index));
                    continue;
                };
                if state.state != State::Up {
                    parts.push(format!(".{}.s:{}", index, state.state.serialized_code()));
                    if let Some(description) = &state.description {
                        parts.push(format!(".{}.m:{}", index, escape(description)));
                    }
                }
                for (partition, partition_state) in &state.partitions {
                    if partition_state.state != State::Up {
                        parts.push(format!(
                            ".{}.p.{}.s:{}",
                            index,
                            partition,
                            partition_state.state.serialized_code()
                        ));
                    }
                }
            }
        }
        parts.join(" ")
    }

    /// Whether two states publish the same content, ignoring versions
    pub fn same_content(&self, other: &ClusterState) -> bool {
        self.to_state_string(false) == other.to_state_string(false)
    }

    /// Per-node transitions from `previous` to this state
    pub fn diff(&self, previous: &ClusterState) -> Vec<NodeStateDiff> {
        let nodes: BTreeSet<&Node> = self.nodes.keys().chain(previous.nodes.keys()).collect();
        nodes
            .into_iter()
            .filter_map(|node| {
                let from = previous.nodes.get(node);
                let to = self.nodes.get(node);
                if from == to {
                    None
                } else {
                    Some(NodeStateDiff {
                        node: *node,
                        from: from.cloned(),
                        to: to.cloned(),
                    })
                }
            })
            .collect()
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_state_string(true))
    }
}

fn escape(description: &str) -> String {
    description.replace('\\', "\\\\").replace(' ', "\\x20")
}

/// A node whose published state changed between two cluster states
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateDiff {
    pub node: Node,
    pub from: Option<NodeState>,
    pub to: Option<NodeState>,
}

impl fmt::Display for NodeStateDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |state: &Option<NodeState>| {
            state.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "absent".to_string())
        };
        write!(f, "{}: {} -> {}", self.node, show(&self.from), show(&self.to))
    }
}

/// Baseline cluster state plus one derived state per bucket space
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStateBundle {
    baseline: ClusterState,
    spaces: BTreeMap<String, ClusterState>,
}

impl ClusterStateBundle {
    pub fn empty() -> Self {
        Self {
            baseline: ClusterState::empty(),
            spaces: BTreeMap::new(),
        }
    }

    /// Every state in the bundle gets the same version
    fn versioned(baseline: ClusterState, spaces: BTreeMap<String, ClusterState>, version: u64) -> Self {
        Self {
            baseline: baseline.with_version(version),
            spaces: spaces
                .into_iter()
                .map(|(name, state)| (name, state.with_version(version)))
                .collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.baseline.version
    }

    pub fn baseline(&self) -> &ClusterState {
        &self.baseline
    }

    pub fn space(&self, name: &str) -> Option<&ClusterState> {
        self.spaces.get(name)
    }

    pub fn spaces(&self) -> impl Iterator<Item = (&String, &ClusterState)> {
        self.spaces.iter()
    }

    pub fn same_content(&self, other: &ClusterStateBundle) -> bool {
        self.baseline.same_content(&other.baseline)
            && self.spaces.len() == other.spaces.len()
            && self.spaces.iter().all(|(name, state)| {
                other.spaces.get(name).map(|o| state.same_content(o)).unwrap_or(false)
            })
    }
}

impl fmt::Display for ClusterStateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.baseline)?;
        for (name, state) in &self.spaces {
            write!(f, " [{}: {}]", name, state.to_state_string(false))?;
        }
        Ok(())
    }
}

/// Derives cluster states from the content cluster
pub struct ClusterStateGenerator;

impl ClusterStateGenerator {
    /// The state a node is published with.
    ///
    /// The wanted state wins when it is more restrictive than the reported one,
    /// except that a node reported down stays down.
    pub fn effective_state(info: &NodeInfo) -> NodeState {
        let reported = info.reported_state();
        let wanted = info.wanted_state();

        let mut effective = if reported.state == State::Down {
            reported.clone()
        } else if wanted.state.is_more_restrictive_than(reported.state) {
            let mut state = NodeState::new(wanted.state);
            state.description = wanted.description.clone();
            state.partitions = reported.partitions.clone();
            state
        } else {
            reported.clone()
        };

        if info.node().is_storage() && info.is_configured_retired() && effective.state == State::Up {
            effective.state = State::Retired;
        }
        if !info.node().is_storage() {
            effective.partitions.clear();
        }
        effective
    }

    fn is_cluster_up(nodes: &BTreeMap<Node, NodeState>, min_storage: usize, min_distributors: usize) -> bool {
        if nodes.is_empty() {
            return false;
        }
        let storage_available = nodes
            .iter()
            .filter(|(node, state)| node.is_storage() && state.state.is_available())
            .count();
        let distributors_up = nodes
            .iter()
            .filter(|(node, state)| !node.is_storage() && state.state == State::Up)
            .count();
        storage_available >= min_storage.max(1) && distributors_up >= min_distributors.max(1)
    }

    /// Baseline state with version 0
    pub fn generate_baseline(cluster: &ContentCluster) -> ClusterState {
        let nodes: BTreeMap<Node, NodeState> = cluster
            .node_infos()
            .map(|info| (info.node(), Self::effective_state(info)))
            .collect();
        let cluster_up = Self::is_cluster_up(
            &nodes,
            cluster.min_storage_up_count(),
            cluster.min_distributor_up_count(),
        );
        ClusterState {
            version: 0,
            cluster_up,
            nodes,
        }
    }

    /// Derive a bucket space state where storage nodes that do not carry the
    /// space are down. Node counts stay those of the baseline.
    pub fn derive_bucket_space(
        baseline: &ClusterState,
        space: &BucketSpaceConfig,
        cluster: &ContentCluster,
    ) -> ClusterState {
        let Some(members) = &space.storage_nodes else {
            return baseline.clone();
        };
        let nodes: BTreeMap<Node, NodeState> = baseline
            .nodes
            .iter()
            .map(|(node, state)| {
                if node.is_storage() && !members.contains(&node.index) {
                    (*node, NodeState::new(State::Down))
                } else {
                    (*node, state.clone())
                }
            })
            .collect();
        let cluster_up = baseline.cluster_up
            && Self::is_cluster_up(&nodes, cluster.min_storage_up_count(), cluster.min_distributor_up_count());
        ClusterState {
            version: baseline.version,
            cluster_up,
            nodes,
        }
    }

    /// Bundle with version 0
    pub fn generate_bundle(cluster: &ContentCluster) -> ClusterStateBundle {
        let baseline = Self::generate_baseline(cluster);
        let spaces = cluster
            .bucket_spaces()
            .iter()
            .map(|space| (space.name.clone(), Self::derive_bucket_space(&baseline, space, cluster)))
            .collect();
        ClusterStateBundle::versioned(baseline, spaces, 0)
    }

    /// Compute the next bundle. Returns `None` when nothing would change, so an
    /// identical recomputation never bumps the version.
    pub fn compute(cluster: &ContentCluster, previous: &ClusterStateBundle) -> Option<ClusterStateBundle> {
        let candidate = Self::generate_bundle(cluster);
        if candidate.same_content(previous) {
            return None;
        }
        let ClusterStateBundle { baseline, spaces } = candidate;
        Some(ClusterStateBundle::versioned(baseline, spaces, previous.version() + 1))
    }
}
