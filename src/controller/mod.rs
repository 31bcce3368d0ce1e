// src/controller/mod.rs

//! The cluster controller: a single-writer event loop over the content cluster.
//!
//! The loop owns the `ContentCluster` and the published `ClusterStateBundle`.
//! Operator tasks, heartbeats, version acknowledgements, mastership changes
//! and topology reloads all arrive as messages on one queue and are applied in
//! order. Published bundles are broadcast to readers as immutable snapshots.

mod ack;
mod master;
mod task;
mod tasks;

pub use ack::VersionAckTracker;
pub use master::{MasterInfo, MasterTransition};
pub use task::{Context, MasterState, Task, TaskState};
pub use tasks::{
    ClusterView, NodeView, QueryScope, ResponseWait, SetClusterStateTask, SetNodeStateTask,
    StateQueryTask, StateView,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use crate::cluster::{
    ChangedNodes, ClusterStateBundle, ClusterStateGenerator, ContentCluster, ControllerConfig,
    Node, NodeState, TopologySource,
};
use crate::common::error::{ControllerError, Result};
use task::{ScheduledTask, TaskEnvelope};

const QUEUE_CAPACITY: usize = 1024;

/// Messages handled by the controller's event loop
pub(crate) enum ControllerMessage {
    Submit(Box<dyn ScheduledTask>),
    ReportState {
        node: Node,
        state: NodeState,
        host_metrics: Option<serde_json::Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    Acknowledge {
        node: Node,
        version: u64,
    },
    SetMaster {
        is_master: bool,
        master_index: Option<u16>,
    },
    ReloadTopology {
        config: ControllerConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// A task that ran and now waits for the cluster to acknowledge a version
struct PendingAck {
    task: Box<dyn ScheduledTask>,
    version: u64,
    deadline: Instant,
}

/// Owner of the content cluster and its published state
pub struct ClusterController {
    cluster: ContentCluster,
    published: Arc<ClusterStateBundle>,
    master: MasterInfo,
    acks: VersionAckTracker,
    pending: Vec<PendingAck>,
    ack_check_interval: Duration,
    default_ack_timeout: Duration,
    state_tx: watch::Sender<Arc<ClusterStateBundle>>,
    rx: mpsc::Receiver<ControllerMessage>,
}

impl ClusterController {
    /// Build the controller and its handle. The first cluster state is computed here.
    pub fn new(config: &ControllerConfig) -> Result<(Self, ControllerHandle)> {
        let cluster = ContentCluster::new(config)?;
        let published = Arc::new(
            ClusterStateGenerator::compute(&cluster, &ClusterStateBundle::empty())
                .unwrap_or_else(ClusterStateBundle::empty),
        );
        info!(
            cluster = cluster.name(),
            version = published.version(),
            state = %published.baseline(),
            "Initial cluster state"
        );

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(Arc::clone(&published));

        let controller = Self {
            cluster,
            published,
            master: MasterInfo::new(config.controller_index, config.master_moratorium()),
            acks: VersionAckTracker::new(),
            pending: Vec::new(),
            ack_check_interval: config.ack_check_interval(),
            default_ack_timeout: config.default_ack_timeout(),
            state_tx,
            rx,
        };
        Ok((controller, ControllerHandle { tx, state_rx }))
    }

    /// Start the event loop on the current runtime
    pub fn spawn(config: &ControllerConfig) -> Result<ControllerHandle> {
        let (controller, handle) = Self::new(config)?;
        tokio::spawn(controller.run());
        Ok(handle)
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.ack_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(ControllerMessage::Shutdown) | None => break,
                    Some(message) => self.handle_message(message),
                },
                _ = ticker.tick() => self.check_pending(Instant::now()),
            }
        }

        for pending in self.pending.drain(..) {
            pending
                .task
                .fail(ControllerError::Internal("Cluster controller shut down".to_string()));
        }
        info!(cluster = self.cluster.name(), "Cluster controller stopped");
    }

    fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Submit(task) => self.process_task(task),
            ControllerMessage::ReportState { node, state, host_metrics, reply } => {
                let result = self.cluster.report_state(node, state, host_metrics);
                match &result {
                    Ok(()) => self.recompute_state("reported state"),
                    Err(e) => warn!(%node, error = %e, "Ignoring reported state"),
                }
                let _ = reply.send(result);
            }
            ControllerMessage::Acknowledge { node, version } => {
                if version > self.published.version() {
                    warn!(
                        %node,
                        version,
                        published = self.published.version(),
                        "Ignoring acknowledgement of a version that was never published"
                    );
                    return;
                }
                debug!(%node, version, "Cluster state version acknowledged");
                self.acks.record(node, version);
                self.check_pending(Instant::now());
            }
            ControllerMessage::SetMaster { is_master, master_index } => {
                self.update_master(is_master, master_index);
            }
            ControllerMessage::ReloadTopology { config, reply } => {
                let result = self.cluster.reload(&config);
                if result.is_ok() {
                    let cluster = &self.cluster;
                    self.acks.retain(|node| cluster.get_node_info(*node).is_ok());
                    self.recompute_state("topology reload");
                }
                let _ = reply.send(result);
            }
            // Handled by the loop
            ControllerMessage::Shutdown => {}
        }
    }

    fn process_task(&mut self, mut task: Box<dyn ScheduledTask>) {
        let now = Instant::now();
        debug!(id = %task.id(), task = task.name(), state = %task.state(), "Running task");

        if task.master_state() == MasterState::MustBeMaster && !self.master.is_master() {
            let reason = self.master.not_master_reason();
            warn!(task = task.name(), %reason, "Rejecting task");
            task.fail(ControllerError::NotMaster(reason));
            return;
        }
        if task.deadline().is_some_and(|deadline| now >= deadline) {
            let reason = format!("Deadline of task {} passed before it was run", task.name());
            warn!(task = task.name(), "Task deadline passed before it could run");
            task.fail(ControllerError::Timeout(reason));
            return;
        }

        let mut changed = ChangedNodes::default();
        let outcome = {
            let mut ctx = Context {
                cluster: &mut self.cluster,
                published: &*self.published,
                master: &self.master,
                listener: &mut changed,
                now,
            };
            task.run(&mut ctx)
        };

        // A failing task may still have changed nodes before it failed
        if !changed.is_empty() {
            debug!(nodes = ?changed.nodes(), "Wanted states changed");
            self.recompute_state("wanted state change");
        }

        match outcome {
            Err(e) => task.fail(e),
            Ok(()) if task.has_version_ack_dependency() => {
                let version = self.published.version();
                if self.acks.is_acked(version, &self.published) {
                    task.complete();
                } else {
                    task.await_ack();
                    debug!(id = %task.id(), task = task.name(), version, "Waiting for version acknowledgement");
                    // Waits without a deadline of their own get the default budget
                    let deadline = task.deadline().unwrap_or(now + self.default_ack_timeout);
                    self.pending.push(PendingAck {
                        deadline,
                        version,
                        task,
                    });
                }
            }
            Ok(()) => task.complete(),
        }
    }

    /// Complete acked waits, fail expired ones and drop abandoned ones
    fn check_pending(&mut self, now: Instant) {
        if self.pending.is_empty() {
            return;
        }
        for pending in std::mem::take(&mut self.pending) {
            if pending.task.is_abandoned() {
                debug!(
                    id = %pending.task.id(),
                    task = pending.task.name(),
                    version = pending.version,
                    "Caller stopped waiting for version acknowledgement"
                );
            } else if self.acks.is_acked(pending.version, &self.published) {
                pending.task.complete();
            } else if now >= pending.deadline {
                let missing = self.acks.pending_nodes(pending.version, &self.published);
                warn!(
                    task = pending.task.name(),
                    version = pending.version,
                    ?missing,
                    "Timed out waiting for version acknowledgement"
                );
                pending.task.fail(ControllerError::Timeout(format!(
                    "Cluster state version {} was not acknowledged by {} node(s) in time; \
                     the change was applied but its propagation is unknown",
                    pending.version,
                    missing.len()
                )));
            } else {
                self.pending.push(pending);
            }
        }
    }

    fn update_master(&mut self, is_master: bool, master_index: Option<u16>) {
        match self.master.update(is_master, master_index, Instant::now()) {
            MasterTransition::Gained => {
                info!(cluster = self.cluster.name(), "Gained mastership; starting moratorium");
            }
            MasterTransition::Lost => {
                let reason = self.master.not_master_reason();
                warn!(cluster = self.cluster.name(), %reason, pending = self.pending.len(), "Lost mastership");
                for pending in self.pending.drain(..) {
                    pending.task.fail(ControllerError::NotMaster(reason.clone()));
                }
            }
            MasterTransition::Unchanged => {}
        }
    }

    /// Publish a new bundle if the cluster state changed
    fn recompute_state(&mut self, cause: &str) {
        let Some(bundle) = ClusterStateGenerator::compute(&self.cluster, &self.published) else {
            debug!(cause, "Cluster state unchanged");
            return;
        };
        for diff in bundle.baseline().diff(self.published.baseline()) {
            info!(%diff, "Node state changed");
        }
        info!(version = bundle.version(), state = %bundle.baseline(), cause, "Publishing cluster state");

        self.published = Arc::new(bundle);
        self.state_tx.send_replace(Arc::clone(&self.published));
        self.check_pending(Instant::now());
    }
}

/// Cloneable handle for talking to a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMessage>,
    state_rx: watch::Receiver<Arc<ClusterStateBundle>>,
}

impl ControllerHandle {
    async fn send(&self, message: ControllerMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ControllerError::Internal("Cluster controller is not running".to_string()))
    }

    async fn receive<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                error!("Cluster controller dropped a request without answering");
                Err(ControllerError::Internal("Cluster controller dropped the request".to_string()))
            }
        }
    }

    /// Submit a task and wait until it completes or fails
    pub async fn submit<T: Task>(&self, task: T) -> Result<T::Output> {
        let (reply, rx) = oneshot::channel();
        self.send(ControllerMessage::Submit(Box::new(TaskEnvelope::new(task, reply)))).await?;
        Self::receive(rx).await
    }

    /// Post a node's self-reported state
    pub async fn report_state(
        &self,
        node: Node,
        state: NodeState,
        host_metrics: Option<serde_json::Value>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControllerMessage::ReportState { node, state, host_metrics, reply }).await?;
        Self::receive(rx).await
    }

    /// Record that a node has applied a cluster state version
    pub async fn acknowledge(&self, node: Node, version: u64) -> Result<()> {
        self.send(ControllerMessage::Acknowledge { node, version }).await
    }

    /// Reflect the election outcome
    pub async fn set_master(&self, is_master: bool, master_index: Option<u16>) -> Result<()> {
        self.send(ControllerMessage::SetMaster { is_master, master_index }).await
    }

    pub async fn reload_topology(&self, config: ControllerConfig) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControllerMessage::ReloadTopology { config, reply }).await?;
        Self::receive(rx).await
    }

    /// Load a topology from the source and apply it
    pub async fn reload_from(&self, source: &dyn TopologySource) -> Result<()> {
        let config = source.load().await?;
        self.reload_topology(config).await
    }

    /// The last published bundle
    pub fn published_state(&self) -> Arc<ClusterStateBundle> {
        Arc::clone(&*self.state_rx.borrow())
    }

    /// Watch every newly published bundle
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterStateBundle>> {
        self.state_rx.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControllerMessage::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Condition, State, user_state};

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::new("music", 0..3);
        config.master_moratorium_secs = 0;
        config.ack_check_interval_ms = 10;
        config
    }

    async fn all_up(handle: &ControllerHandle) {
        for index in 0..3 {
            handle.report_state(Node::storage(index), NodeState::new(State::Up), None).await.unwrap();
            handle.report_state(Node::distributor(index), NodeState::new(State::Up), None).await.unwrap();
        }
    }

    async fn ack_all(handle: &ControllerHandle, version: u64) {
        for index in 0..3 {
            handle.acknowledge(Node::storage(index), version).await.unwrap();
            handle.acknowledge(Node::distributor(index), version).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reported_states_publish_new_versions() {
        let handle = ClusterController::spawn(&config()).unwrap();
        let initial = handle.published_state();
        assert_eq!(initial.version(), 1);
        assert!(!initial.baseline().is_cluster_up());

        let updates = handle.subscribe();
        all_up(&handle).await;
        assert!(updates.has_changed().unwrap());

        let published = handle.published_state();
        assert!(published.version() > initial.version());
        assert!(published.baseline().is_cluster_up());
        for (_, state) in published.spaces() {
            assert_eq!(state.version(), published.version());
        }

        // Same report again does not bump the version
        let version = published.version();
        handle.report_state(Node::storage(0), NodeState::new(State::Up), None).await.unwrap();
        assert_eq!(handle.published_state().version(), version);

        let unknown = handle.report_state(Node::storage(9), NodeState::new(State::Up), None).await;
        assert_eq!(unknown.unwrap_err().kind(), "not_found");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_state_requires_master() {
        let handle = ClusterController::spawn(&config()).unwrap();
        handle.set_master(false, Some(2)).await.unwrap();

        let task = SetNodeStateTask::new(Node::storage(0), user_state("down", ""), Condition::Force);
        let error = handle.submit(task).await.unwrap_err();
        assert!(error.is_retryable());
        assert!(error.to_string().contains("controller 2"));

        // Queries run regardless
        let view = handle.submit(StateQueryTask::new(QueryScope::Cluster)).await.unwrap();
        assert!(matches!(view, StateView::Cluster(_)));
    }

    #[tokio::test]
    async fn test_set_state_waits_for_acknowledgement() {
        let handle = ClusterController::spawn(&config()).unwrap();
        handle.set_master(true, None).await.unwrap();
        all_up(&handle).await;
        let before = handle.published_state().version();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let task = SetNodeStateTask::new(
                    Node::storage(2),
                    user_state("maintenance", "upgrade"),
                    Condition::Safe,
                );
                handle.submit(task).await
            })
        };

        let mut updates = handle.subscribe();
        updates.wait_for(|bundle| bundle.version() > before).await.unwrap();
        let version = handle.published_state().version();
        assert!(!waiter.is_finished());

        ack_all(&handle, version).await;
        let response = waiter.await.unwrap().unwrap();
        assert!(response.was_modified);
    }

    #[tokio::test]
    async fn test_ack_wait_times_out_without_rollback() {
        let handle = ClusterController::spawn(&config()).unwrap();
        handle.set_master(true, None).await.unwrap();
        all_up(&handle).await;

        let task = SetNodeStateTask::new(Node::storage(1), user_state("maintenance", ""), Condition::Force)
            .with_timeout(Duration::from_millis(50));
        let error = handle.submit(task).await.unwrap_err();
        assert_eq!(error.kind(), "timeout");
        assert!(error.to_string().contains("applied"));

        let published = handle.published_state();
        assert_eq!(published.baseline().state_of(Node::storage(1)), State::Maintenance);
    }

    #[tokio::test]
    async fn test_losing_mastership_fails_ack_waits() {
        let handle = ClusterController::spawn(&config()).unwrap();
        handle.set_master(true, None).await.unwrap();
        all_up(&handle).await;

        let before = handle.published_state().version();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let task = SetNodeStateTask::new(Node::storage(0), user_state("down", ""), Condition::Force);
                handle.submit(task).await
            })
        };
        handle.subscribe().wait_for(|bundle| bundle.version() > before).await.unwrap();

        handle.set_master(false, Some(1)).await.unwrap();
        let error = waiter.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), "not_master");
    }

    #[tokio::test]
    async fn test_deadline_passed_before_run_fails_without_change() {
        let handle = ClusterController::spawn(&config()).unwrap();
        handle.set_master(true, None).await.unwrap();
        all_up(&handle).await;
        let version = handle.published_state().version();

        let task = SetNodeStateTask::new(Node::storage(1), user_state("maintenance", ""), Condition::Force)
            .with_timeout(Duration::ZERO);
        let error = handle.submit(task).await.unwrap_err();
        assert_eq!(error.kind(), "timeout");
        assert!(error.to_string().contains("before it was run"));

        let view = handle.submit(StateQueryTask::new(QueryScope::Node(Node::storage(1)))).await.unwrap();
        let StateView::Node(view) = view else {
            panic!("Expected a node view");
        };
        assert_eq!(view.info.wanted_state().state, State::Up);
        assert_eq!(handle.published_state().version(), version);
    }

    #[tokio::test]
    async fn test_ack_wait_without_timeout_uses_default() {
        let mut config = config();
        config.default_ack_timeout_ms = 50;
        let handle = ClusterController::spawn(&config).unwrap();
        handle.set_master(true, None).await.unwrap();
        all_up(&handle).await;

        let task = SetNodeStateTask::new(Node::storage(0), user_state("maintenance", ""), Condition::Force);
        let error = tokio::time::timeout(Duration::from_secs(5), handle.submit(task))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind(), "timeout");
    }

    #[tokio::test]
    async fn test_abandoned_ack_waits_are_released() {
        let (mut controller, _handle) = ClusterController::new(&config()).unwrap();
        controller.update_master(true, None);
        for index in 0..3 {
            controller.cluster.report_state(Node::storage(index), NodeState::new(State::Up), None).unwrap();
            controller.cluster.report_state(Node::distributor(index), NodeState::new(State::Up), None).unwrap();
        }
        controller.recompute_state("test");

        let mut receivers = Vec::new();
        for index in 0..3 {
            let (reply, rx) = oneshot::channel();
            let task = SetNodeStateTask::new(Node::storage(index), user_state("down", ""), Condition::Force);
            controller.process_task(Box::new(TaskEnvelope::new(task, reply)));
            receivers.push(rx);
        }
        assert_eq!(controller.pending.len(), 3);

        drop(receivers);
        controller.check_pending(Instant::now());
        assert!(controller.pending.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledging_unpublished_version_is_ignored() {
        let handle = ClusterController::spawn(&config()).unwrap();
        handle.set_master(true, None).await.unwrap();
        all_up(&handle).await;

        let version = handle.published_state().version();
        ack_all(&handle, version + 10).await;

        let task = SetNodeStateTask::new(Node::storage(0), user_state("down", ""), Condition::Force)
            .with_timeout(Duration::from_millis(50));
        assert_eq!(handle.submit(task).await.unwrap_err().kind(), "timeout");
    }
}
