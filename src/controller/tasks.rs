// src/controller/tasks.rs

//! Set-state and query tasks run on behalf of operators.

use std::collections::BTreeMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use crate::cluster::{
    Condition, Node, NodeInfo, NodeState, RequestedStates, SetResponse, WantedStateSetter,
};
use crate::common::error::Result;
use super::task::{Context, MasterState, Task};

/// When a set-state request is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseWait {
    /// After every node has acknowledged the resulting cluster state
    #[default]
    WaitUntilClusterAcked,
    /// As soon as the wanted state is recorded
    NoWait,
}

/// Set the wanted state of one node
#[derive(Debug, Clone)]
pub struct SetNodeStateTask {
    node: Node,
    requested: RequestedStates,
    condition: Condition,
    response_wait: ResponseWait,
    probe: bool,
    deadline: Option<Instant>,
    was_modified: bool,
}

impl SetNodeStateTask {
    pub fn new(node: Node, requested: RequestedStates, condition: Condition) -> Self {
        Self {
            node,
            requested,
            condition,
            response_wait: ResponseWait::default(),
            probe: false,
            deadline: None,
            was_modified: false,
        }
    }

    pub fn with_response_wait(mut self, response_wait: ResponseWait) -> Self {
        self.response_wait = response_wait;
        self
    }

    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    /// Time budget, counted from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

impl Task for SetNodeStateTask {
    type Output = SetResponse;

    fn name(&self) -> &'static str {
        "set-node-state"
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn run(&mut self, ctx: &mut Context<'_>) -> Result<SetResponse> {
        let in_moratorium = ctx.in_master_moratorium();
        let response = WantedStateSetter::new().set(
            ctx.cluster,
            self.condition,
            &self.requested,
            self.node,
            ctx.listener,
            ctx.published.baseline(),
            in_moratorium,
            self.probe,
        )?;
        self.was_modified = response.was_modified;
        Ok(response)
    }

    fn has_version_ack_dependency(&self) -> bool {
        self.response_wait == ResponseWait::WaitUntilClusterAcked && self.was_modified && !self.probe
    }
}

/// Set the wanted state of every storage node in the cluster
#[derive(Debug, Clone)]
pub struct SetClusterStateTask {
    requested: RequestedStates,
    condition: Condition,
    response_wait: ResponseWait,
    probe: bool,
    deadline: Option<Instant>,
    was_modified: bool,
}

impl SetClusterStateTask {
    pub fn new(requested: RequestedStates, condition: Condition) -> Self {
        Self {
            requested,
            condition,
            response_wait: ResponseWait::default(),
            probe: false,
            deadline: None,
            was_modified: false,
        }
    }

    pub fn with_response_wait(mut self, response_wait: ResponseWait) -> Self {
        self.response_wait = response_wait;
        self
    }

    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

impl Task for SetClusterStateTask {
    type Output = SetResponse;

    fn name(&self) -> &'static str {
        "set-cluster-state"
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn run(&mut self, ctx: &mut Context<'_>) -> Result<SetResponse> {
        let in_moratorium = ctx.in_master_moratorium();
        let response = WantedStateSetter::new().set_all(
            ctx.cluster,
            self.condition,
            &self.requested,
            ctx.listener,
            ctx.published.baseline(),
            in_moratorium,
            self.probe,
        )?;
        self.was_modified = response.was_modified;
        Ok(response)
    }

    fn has_version_ack_dependency(&self) -> bool {
        self.response_wait == ResponseWait::WaitUntilClusterAcked && self.was_modified && !self.probe
    }
}

/// What a state query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    Cluster,
    Node(Node),
}

/// One node as seen by the controller
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub info: NodeInfo,
    /// State of the node in the published baseline
    pub published_state: NodeState,
}

/// The whole cluster as seen by the controller
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    pub cluster_name: String,
    pub version: u64,
    pub cluster_up: bool,
    pub state: String,
    pub bucket_spaces: BTreeMap<String, String>,
    pub is_master: bool,
    pub master_index: Option<u16>,
    pub nodes: Vec<NodeView>,
}

/// Answer to a state query
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StateView {
    Cluster(ClusterView),
    Node(NodeView),
}

/// Read-only view of the cluster or one node. Runs on non-masters too.
#[derive(Debug, Clone)]
pub struct StateQueryTask {
    scope: QueryScope,
}

impl StateQueryTask {
    pub fn new(scope: QueryScope) -> Self {
        Self { scope }
    }

    fn node_view(ctx: &Context<'_>, info: &NodeInfo) -> NodeView {
        let published_state = ctx
            .current_state()
            .node_state(info.node())
            .cloned()
            .unwrap_or_else(|| NodeState::new(ctx.current_state().state_of(info.node())));
        NodeView {
            info: info.clone(),
            published_state,
        }
    }
}

impl Task for StateQueryTask {
    type Output = StateView;

    fn name(&self) -> &'static str {
        "state-query"
    }

    fn master_state(&self) -> MasterState {
        MasterState::NeedNotBeMaster
    }

    fn run(&mut self, ctx: &mut Context<'_>) -> Result<StateView> {
        let ctx: &Context<'_> = ctx;
        match self.scope {
            QueryScope::Node(node) => {
                let info = ctx.cluster().get_node_info(node)?;
                Ok(StateView::Node(Self::node_view(ctx, info)))
            }
            QueryScope::Cluster => {
                let published = ctx.published();
                let nodes = ctx
                    .cluster()
                    .node_infos()
                    .map(|info| Self::node_view(ctx, info))
                    .collect();
                Ok(StateView::Cluster(ClusterView {
                    cluster_name: ctx.cluster().name().to_string(),
                    version: published.version(),
                    cluster_up: published.baseline().is_cluster_up(),
                    state: published.baseline().to_state_string(true),
                    bucket_spaces: published
                        .spaces()
                        .map(|(name, state)| (name.clone(), state.to_state_string(true)))
                        .collect(),
                    is_master: ctx.master().is_master(),
                    master_index: ctx.master().master_index(),
                    nodes,
                }))
            }
        }
    }
}
