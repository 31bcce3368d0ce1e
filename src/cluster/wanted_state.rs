// src/cluster/wanted_state.rs

//! Applying approved wanted state changes.
//!
//! The setter parses the requested user state, asks the safety checker, and
//! when allowed mutates the node's wanted state and notifies the listener.
//! A SAFE change of a storage node is mirrored onto the distributor with the
//! same index so that both halves of the node move together.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};
use crate::common::error::{ControllerError, Result};
use super::checker::Condition;
use super::content_cluster::ContentCluster;
use super::node::{Node, NodeInfo, NodeState, NodeType, State};
use super::state::ClusterState;

/// The only state type operators may set
pub const USER_STATE_TYPE: &str = "user";

/// A requested state: state id (`up`, `retired`, `maintenance`, `down`) and a free-text reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    pub id: String,
    #[serde(default)]
    pub reason: String,
}

impl UnitState {
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Requested states keyed by state type
pub type RequestedStates = BTreeMap<String, UnitState>;

/// Requested states holding only a user state
pub fn user_state(id: &str, reason: &str) -> RequestedStates {
    let mut states = RequestedStates::new();
    states.insert(USER_STATE_TYPE.to_string(), UnitState::new(id, reason));
    states
}

fn describe(requested: &RequestedStates) -> String {
    requested
        .iter()
        .map(|(kind, state)| format!("{}={}({})", kind, state.id, state.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of a set-state request. Not being modified is a valid outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResponse {
    pub reason: String,
    pub was_modified: bool,
}

impl SetResponse {
    pub fn new(reason: impl Into<String>, was_modified: bool) -> Self {
        Self {
            reason: reason.into(),
            was_modified,
        }
    }
}

/// Notified on every accepted wanted state change. Must not fail.
pub trait NodeListener: Send {
    fn handle_new_wanted_node_state(&mut self, node: &NodeInfo, new_state: &NodeState);
}

/// Applies wanted state changes that pass the safety checker
#[derive(Debug, Default, Clone, Copy)]
pub struct WantedStateSetter;

impl WantedStateSetter {
    pub fn new() -> Self {
        Self
    }

    /// Parse the user state out of the requested states
    fn requested_node_state(requested: &RequestedStates, node: Node) -> Result<NodeState> {
        if let Some(kind) = requested.keys().find(|kind| kind.as_str() != USER_STATE_TYPE) {
            return Err(ControllerError::InvalidInput(format!(
                "Only the '{}' state can be set, got state type '{}'",
                USER_STATE_TYPE, kind
            )));
        }
        let unit = requested.get(USER_STATE_TYPE).ok_or_else(|| {
            ControllerError::InvalidInput("No user state given in the request".to_string())
        })?;
        let state = State::from_user_state(&unit.id)?;
        if !state.valid_wanted_state_for(node.node_type) {
            return Err(ControllerError::InvalidInput(format!(
                "{} cannot be set to {}", node, state
            )));
        }
        Ok(NodeState::new(state).with_description(unit.reason.clone()))
    }

    /// Set the wanted state of one node
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &self,
        cluster: &mut ContentCluster,
        condition: Condition,
        requested: &RequestedStates,
        node: Node,
        listener: &mut dyn NodeListener,
        current_state: &ClusterState,
        in_master_moratorium: bool,
        probe: bool,
    ) -> Result<SetResponse> {
        let old_wanted = cluster.get_node_info(node)?.wanted_state().clone();
        let new_wanted = Self::requested_node_state(requested, node)?;

        let result = cluster.calculate_effect_of_new_state(
            node,
            current_state,
            condition,
            &old_wanted,
            &new_wanted,
            in_master_moratorium,
        )?;

        if result.is_already_set() {
            debug!(%node, wanted = %new_wanted, "Wanted state already set");
            return Ok(SetResponse::new(result.reason(), false));
        }
        if !result.is_allowed() {
            return Ok(SetResponse::new(result.reason(), false));
        }
        if probe {
            debug!(%node, %condition, from = %old_wanted, to = %new_wanted, "Probe: change would be applied");
            return Ok(SetResponse::new(result.reason(), true));
        }

        let info = cluster.get_node_info_mut(node)?;
        info.set_wanted_state(new_wanted.clone());
        listener.handle_new_wanted_node_state(info, &new_wanted);
        info!(%node, %condition, from = %old_wanted, to = %new_wanted, "Wanted state changed");

        if node.node_type == NodeType::Storage && condition == Condition::Safe {
            self.set_distributor_wanted_state(
                cluster,
                &new_wanted,
                node.paired(),
                listener,
                current_state,
                in_master_moratorium,
            )?;
        }

        Ok(SetResponse::new(result.reason(), true))
    }

    /// Mirror a storage node's new wanted state onto its distributor
    fn set_distributor_wanted_state(
        &self,
        cluster: &mut ContentCluster,
        storage_state: &NodeState,
        distributor: Node,
        listener: &mut dyn NodeListener,
        current_state: &ClusterState,
        in_master_moratorium: bool,
    ) -> Result<()> {
        let current = match cluster.get_node_info(distributor) {
            Ok(info) => info.wanted_state().state,
            Err(_) => {
                debug!(%distributor, "No paired distributor configured");
                return Ok(());
            }
        };

        let target = match storage_state.state {
            State::Maintenance => State::Down,
            State::Retired => State::Up,
            other => other,
        };
        if !target.valid_wanted_state_for(NodeType::Distributor) {
            return Err(ControllerError::InvalidInput(format!(
                "Cannot mirror storage state {} onto {}", storage_state.state, distributor
            )));
        }
        if current == target {
            return Ok(());
        }

        let requested = user_state(target.as_str(), storage_state.description());
        let response = self.set(
            cluster,
            Condition::Force,
            &requested,
            distributor,
            listener,
            current_state,
            in_master_moratorium,
            false,
        )?;
        if !response.was_modified {
            warn!(%distributor, reason = %response.reason, "Failed to set paired distributor wanted state");
        }
        Ok(())
    }

    /// Set the wanted state of every configured storage node.
    ///
    /// Only allowed with FORCE. A node that is not modified aborts the whole
    /// operation; nodes already changed before it stay changed.
    #[allow(clippy::too_many_arguments)]
    pub fn set_all(
        &self,
        cluster: &mut ContentCluster,
        condition: Condition,
        requested: &RequestedStates,
        listener: &mut dyn NodeListener,
        current_state: &ClusterState,
        in_master_moratorium: bool,
        probe: bool,
    ) -> Result<SetResponse> {
        if condition != Condition::Force {
            return Err(ControllerError::InvalidInput(format!(
                "Setting all nodes in a cluster to a state is only supported with FORCE, got {}",
                condition
            )));
        }

        let indices: Vec<u16> = cluster.get_configured_nodes().keys().copied().collect();
        for index in indices {
            let node = Node::storage(index);
            let response = self.set(
                cluster,
                condition,
                requested,
                node,
                listener,
                current_state,
                in_master_moratorium,
                probe,
            )?;
            if !response.was_modified {
                return Err(ControllerError::UnimplementedPartialFailure {
                    node: node.to_string(),
                    condition: condition.to_string(),
                    requested: describe(requested),
                    state: current_state.to_string(),
                });
            }
        }

        Ok(SetResponse::new("ok", true))
    }
}

/// Listener that records which nodes changed
#[derive(Debug, Default)]
pub struct ChangedNodes {
    nodes: Vec<Node>,
}

impl ChangedNodes {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

impl NodeListener for ChangedNodes {
    fn handle_new_wanted_node_state(&mut self, node: &NodeInfo, _new_state: &NodeState) {
        self.nodes.push(node.node());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::ControllerConfig;
    use crate::cluster::state::ClusterStateGenerator;

    fn cluster_all_up(nodes: u16) -> ContentCluster {
        let mut cluster = ContentCluster::new(&ControllerConfig::new("music", 0..nodes)).unwrap();
        for index in 0..nodes {
            cluster.report_state(Node::storage(index), NodeState::new(State::Up), None).unwrap();
            cluster.report_state(Node::distributor(index), NodeState::new(State::Up), None).unwrap();
        }
        cluster
    }

    fn wanted(cluster: &ContentCluster, node: Node) -> State {
        cluster.get_node_info(node).unwrap().wanted_state().state
    }

    fn set(cluster: &mut ContentCluster, node: Node, id: &str, condition: Condition, probe: bool) -> Result<SetResponse> {
        let state = ClusterStateGenerator::generate_baseline(cluster);
        let mut listener = ChangedNodes::default();
        WantedStateSetter::new().set(cluster, condition, &user_state(id, ""), node, &mut listener, &state, false, probe)
    }

    #[test]
    fn test_invalid_requests() {
        let mut cluster = cluster_all_up(3);
        let state = ClusterStateGenerator::generate_baseline(&cluster);
        let mut listener = ChangedNodes::default();
        let setter = WantedStateSetter::new();

        let err = set(&mut cluster, Node::storage(0), "initializing", Condition::Force, false).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(_)));

        let err = set(&mut cluster, Node::distributor(0), "maintenance", Condition::Force, false).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(_)));

        let err = set(&mut cluster, Node::storage(8), "down", Condition::Force, false).unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)));

        let mut requested = RequestedStates::new();
        requested.insert("generated".to_string(), UnitState::new("down", ""));
        let err = setter
            .set(&mut cluster, Condition::Force, &requested, Node::storage(0), &mut listener, &state, false, false)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(_)));

        let err = setter
            .set(&mut cluster, Condition::Force, &RequestedStates::new(), Node::storage(0), &mut listener, &state, false, false)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(_)));
        assert!(listener.is_empty());
    }

    #[test]
    fn test_probe_does_not_mutate() {
        let mut cluster = cluster_all_up(3);
        let probed = set(&mut cluster, Node::storage(2), "maintenance", Condition::Safe, true).unwrap();
        assert!(probed.was_modified);
        assert_eq!(wanted(&cluster, Node::storage(2)), State::Up);
        assert_eq!(wanted(&cluster, Node::distributor(2)), State::Up);

        let applied = set(&mut cluster, Node::storage(2), "maintenance", Condition::Safe, false).unwrap();
        assert_eq!(applied, probed);
        assert_eq!(wanted(&cluster, Node::storage(2)), State::Maintenance);
    }

    #[test]
    fn test_already_set_is_not_modified() {
        let mut cluster = cluster_all_up(3);
        for condition in [Condition::Safe, Condition::Force] {
            for probe in [true, false] {
                let response = set(&mut cluster, Node::storage(0), "up", condition, probe).unwrap();
                assert!(!response.was_modified);
                assert!(response.reason.contains("already"));
            }
        }
    }

    #[test]
    fn test_safe_maintenance_takes_distributor_down() {
        let mut cluster = cluster_all_up(3);
        let state = ClusterStateGenerator::generate_baseline(&cluster);
        let mut listener = ChangedNodes::default();
        WantedStateSetter::new()
            .set(
                &mut cluster,
                Condition::Safe,
                &user_state("maintenance", "kernel upgrade"),
                Node::storage(1),
                &mut listener,
                &state,
                false,
                false,
            )
            .unwrap();

        assert_eq!(listener.nodes(), &[Node::storage(1), Node::distributor(1)]);
        let distributor = cluster.get_node_info(Node::distributor(1)).unwrap();
        assert_eq!(distributor.wanted_state().state, State::Down);
        assert_eq!(distributor.wanted_state().description(), "kernel upgrade");
    }

    #[test]
    fn test_safe_retired_and_up_coupling() {
        let mut cluster = cluster_all_up(3);
        set(&mut cluster, Node::storage(0), "retired", Condition::Safe, false).unwrap();
        assert_eq!(wanted(&cluster, Node::storage(0)), State::Retired);
        assert_eq!(wanted(&cluster, Node::distributor(0)), State::Up);

        set(&mut cluster, Node::storage(1), "maintenance", Condition::Safe, false).unwrap();
        assert_eq!(wanted(&cluster, Node::distributor(1)), State::Down);
        set(&mut cluster, Node::storage(1), "up", Condition::Safe, false).unwrap();
        assert_eq!(wanted(&cluster, Node::storage(1)), State::Up);
        assert_eq!(wanted(&cluster, Node::distributor(1)), State::Up);
    }

    #[test]
    fn test_force_does_not_couple() {
        let mut cluster = cluster_all_up(3);
        set(&mut cluster, Node::storage(1), "maintenance", Condition::Force, false).unwrap();
        assert_eq!(wanted(&cluster, Node::storage(1)), State::Maintenance);
        assert_eq!(wanted(&cluster, Node::distributor(1)), State::Up);
    }

    #[test]
    fn test_set_all_requires_force() {
        let mut cluster = cluster_all_up(3);
        let state = ClusterStateGenerator::generate_baseline(&cluster);
        let mut listener = ChangedNodes::default();
        let err = WantedStateSetter::new()
            .set_all(&mut cluster, Condition::Safe, &user_state("down", ""), &mut listener, &state, false, false)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidInput(_)));
        assert!(listener.is_empty());

        let response = WantedStateSetter::new()
            .set_all(&mut cluster, Condition::Force, &user_state("down", "power"), &mut listener, &state, false, false)
            .unwrap();
        assert!(response.was_modified);
        for index in 0..3 {
            assert_eq!(wanted(&cluster, Node::storage(index)), State::Down);
            assert_eq!(wanted(&cluster, Node::distributor(index)), State::Up);
        }
    }

    #[test]
    fn test_set_all_fails_fast_on_unmodified_node() {
        let mut cluster = cluster_all_up(3);
        set(&mut cluster, Node::storage(1), "down", Condition::Force, false).unwrap();

        let state = ClusterStateGenerator::generate_baseline(&cluster);
        let mut listener = ChangedNodes::default();
        let err = WantedStateSetter::new()
            .set_all(&mut cluster, Condition::Force, &user_state("down", ""), &mut listener, &state, false, false)
            .unwrap_err();
        match err {
            ControllerError::UnimplementedPartialFailure { node, condition, .. } => {
                assert_eq!(node, "storage.1");
                assert_eq!(condition, "FORCE");
            }
            other => panic!("unexpected error {:?}", other),
        }
        // Node 0 was applied before the failure and is not rolled back
        assert_eq!(wanted(&cluster, Node::storage(0)), State::Down);
        assert_eq!(wanted(&cluster, Node::storage(2)), State::Up);
    }
}
