// src/cluster/node.rs

//! Node identities and node states for the content cluster.
//!
//! A node is identified by its role (storage or distributor) and a configured
//! index. Each node has a reported state coming from its heartbeats and a wanted
//! state set by the operator; both are `NodeState` values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use crate::common::error::{ControllerError, Result};

/// The role of a node in the content cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Distributor node (owns bucket ownership and routing)
    Distributor,
    /// Storage node (holds the document replicas)
    Storage,
}

impl NodeType {
    /// The lowercase name used in state strings and node identifiers
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Distributor => "distributor",
            NodeType::Storage => "storage",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "storage" => Ok(NodeType::Storage),
            "distributor" => Ok(NodeType::Distributor),
            other => Err(ControllerError::InvalidInput(format!("Unknown node type '{}'", other))),
        }
    }
}

/// Identity of a node: role plus configured index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub node_type: NodeType,
    pub index: u16,
}

impl Node {
    pub fn new(node_type: NodeType, index: u16) -> Self {
        Self { node_type, index }
    }

    pub fn storage(index: u16) -> Self {
        Self::new(NodeType::Storage, index)
    }

    pub fn distributor(index: u16) -> Self {
        Self::new(NodeType::Distributor, index)
    }

    pub fn is_storage(&self) -> bool {
        self.node_type == NodeType::Storage
    }

    /// The node with the same index and the other role
    pub fn paired(&self) -> Node {
        match self.node_type {
            NodeType::Storage => Node::distributor(self.index),
            NodeType::Distributor => Node::storage(self.index),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.index)
    }
}

impl FromStr for Node {
    type Err = ControllerError;

    /// Parses identifiers like `storage.3` or `distributor.0`
    fn from_str(s: &str) -> Result<Self> {
        let (node_type, index) = s.split_once('.').ok_or_else(|| {
            ControllerError::InvalidInput(format!("Invalid node identifier '{}', expected <type>.<index>", s))
        })?;
        let node_type = node_type.parse::<NodeType>()?;
        let index = index.parse::<u16>().map_err(|_| {
            ControllerError::InvalidInput(format!("Invalid node index in '{}'", s))
        })?;
        Ok(Node::new(node_type, index))
    }
}

/// State code of a node or partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Up,
    Initializing,
    Retired,
    Maintenance,
    Stopping,
    Down,
}

impl State {
    /// Single character code used in cluster state strings
    pub fn serialized_code(&self) -> &'static str {
        match self {
            State::Up => "u",
            State::Initializing => "i",
            State::Retired => "r",
            State::Maintenance => "m",
            State::Stopping => "s",
            State::Down => "d",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Up => "up",
            State::Initializing => "initializing",
            State::Retired => "retired",
            State::Maintenance => "maintenance",
            State::Stopping => "stopping",
            State::Down => "down",
        }
    }

    /// Rank used when merging reported and wanted states; higher is more restrictive.
    pub fn restrictiveness(&self) -> u8 {
        match self {
            State::Up => 0,
            State::Initializing => 1,
            State::Retired => 2,
            State::Maintenance => 3,
            State::Stopping => 4,
            State::Down => 5,
        }
    }

    pub fn is_more_restrictive_than(&self, other: State) -> bool {
        self.restrictiveness() > other.restrictiveness()
    }

    /// Whether a node in this state serves data and counts towards group redundancy
    pub fn is_available(&self) -> bool {
        matches!(self, State::Up | State::Retired)
    }

    /// Whether a node in this state is expected to receive and acknowledge cluster states
    pub fn expects_state_acks(&self) -> bool {
        matches!(self, State::Up | State::Initializing | State::Retired)
    }

    /// Parses an operator supplied user state. Only `up`, `retired`,
    /// `maintenance` and `down` may be requested.
    pub fn from_user_state(value: &str) -> Result<State> {
        match value.to_lowercase().as_str() {
            "up" => Ok(State::Up),
            "retired" => Ok(State::Retired),
            "maintenance" => Ok(State::Maintenance),
            "down" => Ok(State::Down),
            other => Err(ControllerError::InvalidInput(format!(
                "Invalid user state '{}', expected one of up, retired, maintenance, down",
                other
            ))),
        }
    }

    /// Whether an operator may set this as wanted state for the given node type
    pub fn valid_wanted_state_for(&self, node_type: NodeType) -> bool {
        match node_type {
            NodeType::Storage => matches!(self, State::Up | State::Retired | State::Maintenance | State::Down),
            NodeType::Distributor => matches!(self, State::Up | State::Down),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = ControllerError;

    /// Any state a node may report, by name or single character code
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "up" | "u" => Ok(State::Up),
            "initializing" | "i" => Ok(State::Initializing),
            "retired" | "r" => Ok(State::Retired),
            "maintenance" | "m" => Ok(State::Maintenance),
            "stopping" | "s" => Ok(State::Stopping),
            "down" | "d" => Ok(State::Down),
            other => Err(ControllerError::InvalidInput(format!("Unknown node state '{}'", other))),
        }
    }
}

/// State of a single partition (disk) on a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// State of a node: a code, an optional description and optional partition sub-states.
///
/// Equality only looks at the code and the description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partitions: BTreeMap<u16, PartitionState>,
}

impl NodeState {
    pub fn new(state: State) -> Self {
        Self {
            state,
            description: None,
            partitions: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = if description.is_empty() { None } else { Some(description) };
        self
    }

    pub fn with_partition(mut self, partition: u16, state: State) -> Self {
        self.partitions.insert(partition, PartitionState { state, description: None });
        self
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Rejects partition sub-states on node types that have no partitions
    pub fn validate_for(&self, node_type: NodeType) -> Result<()> {
        if node_type == NodeType::Distributor && !self.partitions.is_empty() {
            return Err(ControllerError::InvalidInput(
                "Partition states are only supported for storage nodes".to_string(),
            ));
        }
        Ok(())
    }
}

impl PartialEq for NodeState {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state && self.description() == other.description()
    }
}

impl Eq for NodeState {}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.state, description),
            None => write!(f, "{}", self.state),
        }
    }
}

/// Per-node record held by the content cluster
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    node: Node,
    /// Path of the leaf group holding this node (storage nodes only)
    group: Option<String>,
    reported_state: NodeState,
    wanted_state: NodeState,
    /// Whether configuration marks the node as retired
    configured_retired: bool,
    /// Latest host metrics from the node's health reports, opaque to the controller
    host_metrics: Option<serde_json::Value>,
    last_report_at: Option<chrono::DateTime<chrono::Utc>>,
    wanted_state_changed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl NodeInfo {
    /// A freshly configured node has not reported yet (down) and is wanted up
    pub fn new(node: Node, group: Option<String>, configured_retired: bool) -> Self {
        Self {
            node,
            group,
            reported_state: NodeState::new(State::Down).with_description("Node has not reported yet"),
            wanted_state: NodeState::new(State::Up),
            configured_retired,
            host_metrics: None,
            last_report_at: None,
            wanted_state_changed_at: None,
        }
    }

    pub fn node(&self) -> Node {
        self.node
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn reported_state(&self) -> &NodeState {
        &self.reported_state
    }

    pub fn wanted_state(&self) -> &NodeState {
        &self.wanted_state
    }

    pub fn is_configured_retired(&self) -> bool {
        self.configured_retired
    }

    pub fn host_metrics(&self) -> Option<&serde_json::Value> {
        self.host_metrics.as_ref()
    }

    pub fn last_report_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_report_at
    }

    pub fn wanted_state_changed_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.wanted_state_changed_at
    }

    /// Only called from the heartbeat ingestion path
    pub(crate) fn set_reported_state(&mut self, state: NodeState, host_metrics: Option<serde_json::Value>) {
        self.reported_state = state;
        if host_metrics.is_some() {
            self.host_metrics = host_metrics;
        }
        self.last_report_at = Some(chrono::Utc::now());
    }

    /// Only called from the wanted state setter
    pub(crate) fn set_wanted_state(&mut self, state: NodeState) {
        self.wanted_state = state;
        self.wanted_state_changed_at = Some(chrono::Utc::now());
    }

    pub(crate) fn set_group(&mut self, group: Option<String>) {
        self.group = group;
    }

    pub(crate) fn set_configured_retired(&mut self, retired: bool) {
        self.configured_retired = retired;
    }
}
