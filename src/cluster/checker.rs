// src/cluster/checker.rs

//! Safety gate for wanted state changes.
//!
//! The checker decides, without mutating anything, whether a node's wanted
//! state may move from one state to another right now. SAFE requests are
//! evaluated against the last published cluster state so that an operator
//! cannot take a group below its redundancy floor by accident.

use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use tracing::debug;
use crate::common::error::{ControllerError, Result};
use super::content_cluster::ContentCluster;
use super::node::{Node, NodeInfo, NodeState, NodeType, State};
use super::state::ClusterState;

/// How careful a wanted state change must be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Apply regardless of redundancy; the operator accepts the risk
    Force,
    /// Apply only if the redundancy floor holds afterwards
    Safe,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Force => f.write_str("FORCE"),
            Condition::Safe => f.write_str("SAFE"),
        }
    }
}

impl FromStr for Condition {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "force" => Ok(Condition::Force),
            "safe" => Ok(Condition::Safe),
            other => Err(ControllerError::InvalidInput(format!(
                "Invalid condition '{}', expected force or safe", other
            ))),
        }
    }
}

/// Outcome of a safety check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    allowed: bool,
    already_set: bool,
    reason: String,
}

impl CheckResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            already_set: false,
            reason: "ok".to_string(),
        }
    }

    pub fn disallow(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            already_set: false,
            reason: reason.into(),
        }
    }

    pub fn already_set(wanted: &NodeState) -> Self {
        Self {
            allowed: false,
            already_set: true,
            reason: format!("No need to change: wanted state is already {}", wanted),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_already_set(&self) -> bool {
        self.already_set
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Returns true when `remaining` available nodes satisfy a redundancy floor.
///
/// A group exactly at its floor is acceptable; one below it is not.
pub fn satisfies_redundancy_floor(remaining: usize, floor: usize) -> bool {
    remaining >= floor
}

/// Evaluates proposed wanted state transitions for nodes of one content cluster
pub(crate) struct NodeStateChangeChecker<'a> {
    cluster: &'a ContentCluster,
}

impl<'a> NodeStateChangeChecker<'a> {
    pub(crate) fn new(cluster: &'a ContentCluster) -> Self {
        Self { cluster }
    }

    /// Decide whether `node` may go from `old_wanted` to `new_wanted`.
    ///
    /// Unknown nodes are reported as `NotFound`, never as a denial.
    pub(crate) fn evaluate_transition(
        &self,
        node: Node,
        cluster_state: &ClusterState,
        condition: Condition,
        old_wanted: &NodeState,
        new_wanted: &NodeState,
        in_master_moratorium: bool,
    ) -> Result<CheckResult> {
        let node_info = self.cluster.get_node_info(node)?;

        if in_master_moratorium {
            return Ok(CheckResult::disallow(
                "Cluster controller has not yet established ownership of cluster state (master moratorium)",
            ));
        }

        if old_wanted == new_wanted {
            return Ok(CheckResult::already_set(new_wanted));
        }

        let result = match condition {
            Condition::Force => CheckResult::allow(),
            Condition::Safe => self.evaluate_safe(node_info, cluster_state, old_wanted, new_wanted),
        };
        if !result.is_allowed() {
            debug!(%node, %condition, from = %old_wanted, to = %new_wanted, reason = result.reason(), "Denied wanted state change");
        }
        Ok(result)
    }

    fn evaluate_safe(
        &self,
        node_info: &NodeInfo,
        cluster_state: &ClusterState,
        old_wanted: &NodeState,
        new_wanted: &NodeState,
    ) -> CheckResult {
        let node = node_info.node();
        if node.node_type != NodeType::Storage {
            return CheckResult::disallow(format!(
                "Safe-set of node state is only supported for storage nodes! Requested node type: {}",
                node.node_type
            ));
        }

        // Moving towards availability never lowers redundancy
        let increases_risk = old_wanted.state.is_available() && !new_wanted.state.is_available();
        if !increases_risk {
            return CheckResult::allow();
        }

        let Some(group) = self.cluster.leaf_group(node.index) else {
            return CheckResult::disallow(format!("{} is not placed in any group", node));
        };
        let floor = group.min_redundancy();
        let others: Vec<u16> = group.nodes().iter().copied().filter(|i| *i != node.index).collect();

        // A failing node must not be hidden behind maintenance or down while
        // its group is already short of healthy reporters
        if node_info.reported_state().state != State::Up {
            let reporting_up = others
                .iter()
                .filter(|i| {
                    self.cluster
                        .get_node_info(Node::storage(**i))
                        .map(|info| info.reported_state().state == State::Up)
                        .unwrap_or(false)
                })
                .count();
            if !satisfies_redundancy_floor(reporting_up, floor) {
                return CheckResult::disallow(format!(
                    "{} already reports {} and only {} other node(s) in group '{}' report up, \
                     below the redundancy floor of {}; setting it to {} would mask the failure",
                    node,
                    node_info.reported_state().state,
                    reporting_up,
                    group.path(),
                    floor,
                    new_wanted.state
                ));
            }
        }

        let available = others
            .iter()
            .filter(|i| cluster_state.state_of(Node::storage(**i)).is_available())
            .count();
        if !satisfies_redundancy_floor(available, floor) {
            return CheckResult::disallow(format!(
                "Not enough available nodes in group '{}': setting {} to {} would leave {} available \
                 node(s) in cluster state version {}, below the redundancy floor of {}",
                group.path(),
                node,
                new_wanted.state,
                available,
                cluster_state.version(),
                floor
            ));
        }

        CheckResult::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::ControllerConfig;
    use crate::cluster::group::GroupConfig;
    use crate::cluster::state::ClusterStateGenerator;

    fn cluster_with_all_up(nodes: u16) -> ContentCluster {
        let config = ControllerConfig::new("music", 0..nodes);
        let mut cluster = ContentCluster::new(&config).unwrap();
        for index in 0..nodes {
            cluster.report_state(Node::storage(index), NodeState::new(State::Up), None).unwrap();
            cluster.report_state(Node::distributor(index), NodeState::new(State::Up), None).unwrap();
        }
        cluster
    }

    fn published(cluster: &ContentCluster) -> ClusterState {
        ClusterStateGenerator::generate_baseline(cluster)
    }

    fn maintenance() -> NodeState {
        NodeState::new(State::Maintenance)
    }

    fn up() -> NodeState {
        NodeState::new(State::Up)
    }

    #[test]
    fn test_floor_boundary_is_inclusive() {
        assert!(satisfies_redundancy_floor(2, 2));
        assert!(satisfies_redundancy_floor(3, 2));
        assert!(!satisfies_redundancy_floor(1, 2));
        assert!(satisfies_redundancy_floor(0, 0));
    }

    #[test]
    fn test_moratorium_denies_everything() {
        let cluster = cluster_with_all_up(3);
        let state = published(&cluster);
        let result = cluster
            .calculate_effect_of_new_state(Node::storage(0), &state, Condition::Force, &up(), &maintenance(), true)
            .unwrap();
        assert!(!result.is_allowed());
        assert!(!result.is_already_set());
        assert!(result.reason().contains("moratorium"));
    }

    #[test]
    fn test_same_state_is_already_set() {
        let cluster = cluster_with_all_up(3);
        let state = published(&cluster);
        for condition in [Condition::Force, Condition::Safe] {
            let result = cluster
                .calculate_effect_of_new_state(Node::storage(1), &state, condition, &up(), &up(), false)
                .unwrap();
            assert!(result.is_already_set());
            assert!(!result.is_allowed());
        }

        let described = maintenance().with_description("upgrade");
        let other = maintenance().with_description("reboot");
        let result = cluster
            .calculate_effect_of_new_state(Node::storage(1), &state, Condition::Safe, &described, &other, false)
            .unwrap();
        assert!(!result.is_already_set());
        assert!(result.is_allowed());
    }

    #[test]
    fn test_safe_floor_in_single_group() {
        let mut cluster = cluster_with_all_up(3);
        let state = published(&cluster);

        let result = cluster
            .calculate_effect_of_new_state(Node::storage(2), &state, Condition::Safe, &up(), &maintenance(), false)
            .unwrap();
        assert!(result.is_allowed(), "{}", result.reason());

        cluster.get_node_info_mut(Node::storage(2)).unwrap().set_wanted_state(maintenance());
        let state = published(&cluster);

        let result = cluster
            .calculate_effect_of_new_state(Node::storage(1), &state, Condition::Safe, &up(), &maintenance(), false)
            .unwrap();
        assert!(!result.is_allowed());
        assert!(result.reason().contains("Not enough available nodes"), "{}", result.reason());

        let result = cluster
            .calculate_effect_of_new_state(Node::storage(1), &state, Condition::Force, &up(), &maintenance(), false)
            .unwrap();
        assert!(result.is_allowed());
    }

    #[test]
    fn test_safe_risk_reducing_transitions_allowed() {
        let mut cluster = cluster_with_all_up(2);
        for index in 0..2 {
            cluster.get_node_info_mut(Node::storage(index)).unwrap().set_wanted_state(maintenance());
        }
        let state = published(&cluster);
        let result = cluster
            .calculate_effect_of_new_state(Node::storage(0), &state, Condition::Safe, &maintenance(), &up(), false)
            .unwrap();
        assert!(result.is_allowed());

        let result = cluster
            .calculate_effect_of_new_state(
                Node::storage(0),
                &state,
                Condition::Safe,
                &maintenance(),
                &NodeState::new(State::Down),
                false,
            )
            .unwrap();
        assert!(result.is_allowed());
    }

    #[test]
    fn test_safe_uses_published_state_not_wanted() {
        let mut cluster = cluster_with_all_up(3);
        // Node 0 is reported down, so it is unavailable in the published state
        cluster.report_state(Node::storage(0), NodeState::new(State::Down), None).unwrap();
        let state = published(&cluster);

        let result = cluster
            .calculate_effect_of_new_state(Node::storage(2), &state, Condition::Safe, &up(), &maintenance(), false)
            .unwrap();
        assert!(!result.is_allowed());
    }

    #[test]
    fn test_safe_refuses_to_mask_failing_node() {
        let mut config = ControllerConfig::new("music", 0..4);
        config.redundancy = 2;
        let mut cluster = ContentCluster::new(&config).unwrap();
        cluster.report_state(Node::storage(0), NodeState::new(State::Up), None).unwrap();
        cluster.report_state(Node::storage(1), NodeState::new(State::Initializing), None).unwrap();
        cluster.report_state(Node::storage(2), NodeState::new(State::Initializing), None).unwrap();
        cluster.report_state(Node::storage(3), NodeState::new(State::Initializing), None).unwrap();
        let state = published(&cluster);

        // Only node 0 reports up besides the target
        let result = cluster
            .calculate_effect_of_new_state(Node::storage(1), &state, Condition::Safe, &up(), &maintenance(), false)
            .unwrap();
        assert!(!result.is_allowed());
        assert!(result.reason().contains("mask"), "{}", result.reason());
    }

    #[test]
    fn test_safe_floor_is_per_group() {
        let mut config = ControllerConfig::new("music", 0..4);
        config.group = Some(GroupConfig {
            name: "root".to_string(),
            min_redundancy: Some(1),
            nodes: vec![],
            groups: vec![
                GroupConfig { name: "g0".to_string(), min_redundancy: None, nodes: vec![0, 1], groups: vec![] },
                GroupConfig { name: "g1".to_string(), min_redundancy: None, nodes: vec![2, 3], groups: vec![] },
            ],
        });
        let mut cluster = ContentCluster::new(&config).unwrap();
        for index in 0..4 {
            cluster.report_state(Node::storage(index), NodeState::new(State::Up), None).unwrap();
        }
        cluster.get_node_info_mut(Node::storage(0)).unwrap().set_wanted_state(maintenance());
        let state = published(&cluster);

        // g0 would be empty
        let result = cluster
            .calculate_effect_of_new_state(Node::storage(1), &state, Condition::Safe, &up(), &maintenance(), false)
            .unwrap();
        assert!(!result.is_allowed());

        // g1 is untouched by g0's maintenance
        let result = cluster
            .calculate_effect_of_new_state(Node::storage(2), &state, Condition::Safe, &up(), &maintenance(), false)
            .unwrap();
        assert!(result.is_allowed());
    }

    #[test]
    fn test_safe_on_distributor_denied() {
        let cluster = cluster_with_all_up(3);
        let state = published(&cluster);
        let result = cluster
            .calculate_effect_of_new_state(
                Node::distributor(0),
                &state,
                Condition::Safe,
                &up(),
                &NodeState::new(State::Down),
                false,
            )
            .unwrap();
        assert!(!result.is_allowed());
        assert!(result.reason().contains("only supported for storage nodes"));
    }

    #[test]
    fn test_unknown_node_is_not_found() {
        let cluster = cluster_with_all_up(3);
        let state = published(&cluster);
        let err = cluster
            .calculate_effect_of_new_state(Node::storage(9), &state, Condition::Safe, &up(), &maintenance(), false)
            .unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)));
    }

    #[test]
    fn test_condition_parsing() {
        assert_eq!("SAFE".parse::<Condition>().unwrap(), Condition::Safe);
        assert_eq!("force".parse::<Condition>().unwrap(), Condition::Force);
        assert!("careful".parse::<Condition>().is_err());
        assert_eq!(Condition::Safe.to_string(), "SAFE");
    }
}
