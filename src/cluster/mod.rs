// src/cluster/mod.rs

//! Content cluster model and the node state safety engine.
//!
//! This module holds the cluster registry, the cluster state computation, the
//! safety checker that gates wanted state changes, and the setter that applies
//! approved changes.

mod checker;
mod config;
mod content_cluster;
mod group;
mod node;
mod state;
mod topology;
mod wanted_state;

pub use checker::{CheckResult, Condition, satisfies_redundancy_floor};
pub use config::{BucketSpaceConfig, ConfiguredNode, ControllerConfig};
pub use content_cluster::ContentCluster;
pub use group::{Group, GroupConfig};
pub use node::{Node, NodeInfo, NodeState, NodeType, PartitionState, State};
pub use state::{ClusterState, ClusterStateBundle, ClusterStateGenerator, NodeStateDiff};
pub use topology::{FileTopologySource, StaticTopologySource, TopologySource};
pub use wanted_state::{
    ChangedNodes, NodeListener, RequestedStates, SetResponse, UnitState, WantedStateSetter,
    USER_STATE_TYPE, user_state,
};
