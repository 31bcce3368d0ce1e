// src/controller/task.rs

//! The unit of work run by the controller's event loop.
//!
//! Every read or mutation of the content cluster is expressed as a task and
//! submitted to the single writer. A task runs to completion within one turn
//! of the loop and cannot observe a half-applied change made by another task.
//! Tasks whose effect must reach the nodes before the caller is answered
//! declare a version acknowledgement dependency; they are parked until every
//! node has acknowledged the resulting cluster state, or their deadline passes.

use std::fmt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;
use crate::cluster::{ClusterState, ClusterStateBundle, ContentCluster, NodeListener};
use crate::common::error::{ControllerError, Result};
use super::master::MasterInfo;

/// Whether a task may run on a controller that is not master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    MustBeMaster,
    NeedNotBeMaster,
}

/// Lifecycle of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Submitted,
    Running,
    /// Ran, waiting for the cluster to acknowledge the resulting state
    AwaitingAck,
    Completed,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Submitted => "submitted",
            TaskState::Running => "running",
            TaskState::AwaitingAck => "awaiting_ack",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// What a task sees while it runs
pub struct Context<'a> {
    pub(crate) cluster: &'a mut ContentCluster,
    pub(crate) published: &'a ClusterStateBundle,
    pub(crate) master: &'a MasterInfo,
    pub(crate) listener: &'a mut dyn NodeListener,
    pub(crate) now: Instant,
}

impl<'a> Context<'a> {
    pub fn cluster(&self) -> &ContentCluster {
        &*self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut ContentCluster {
        &mut *self.cluster
    }

    /// The last published bundle
    pub fn published(&self) -> &ClusterStateBundle {
        self.published
    }

    /// Baseline of the last published bundle
    pub fn current_state(&self) -> &ClusterState {
        self.published.baseline()
    }

    pub fn master(&self) -> &MasterInfo {
        self.master
    }

    pub fn in_master_moratorium(&self) -> bool {
        self.master.in_moratorium(self.now)
    }

    pub fn listener(&mut self) -> &mut dyn NodeListener {
        &mut *self.listener
    }
}

/// A unit of work for the controller's event loop
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn master_state(&self) -> MasterState {
        MasterState::MustBeMaster
    }

    /// Point in time after which a task still waiting for acknowledgements fails
    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn run(&mut self, ctx: &mut Context<'_>) -> Result<Self::Output>;

    /// Asked after a successful run
    fn has_version_ack_dependency(&self) -> bool {
        false
    }
}

/// A submitted task with its output erased, as held by the event loop
pub(crate) trait ScheduledTask: Send {
    fn id(&self) -> Uuid;
    fn name(&self) -> &'static str;
    fn state(&self) -> TaskState;
    fn master_state(&self) -> MasterState;
    fn deadline(&self) -> Option<Instant>;
    fn run(&mut self, ctx: &mut Context<'_>) -> Result<()>;
    fn has_version_ack_dependency(&self) -> bool;
    fn await_ack(&mut self);
    /// The submitter stopped waiting for the answer
    fn is_abandoned(&self) -> bool;
    fn complete(self: Box<Self>);
    fn fail(self: Box<Self>, error: ControllerError);
}

/// A task bundled with the channel its result is answered on
pub(crate) struct TaskEnvelope<T: Task> {
    id: Uuid,
    task: T,
    state: TaskState,
    output: Option<T::Output>,
    reply: oneshot::Sender<Result<T::Output>>,
}

impl<T: Task> TaskEnvelope<T> {
    pub(crate) fn new(task: T, reply: oneshot::Sender<Result<T::Output>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            state: TaskState::Submitted,
            output: None,
            reply,
        }
    }
}

impl<T: Task> ScheduledTask for TaskEnvelope<T> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &'static str {
        self.task.name()
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn master_state(&self) -> MasterState {
        self.task.master_state()
    }

    fn deadline(&self) -> Option<Instant> {
        self.task.deadline()
    }

    fn run(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        self.state = TaskState::Running;
        let output = self.task.run(ctx)?;
        self.output = Some(output);
        Ok(())
    }

    fn has_version_ack_dependency(&self) -> bool {
        self.task.has_version_ack_dependency()
    }

    fn await_ack(&mut self) {
        self.state = TaskState::AwaitingAck;
    }

    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn complete(mut self: Box<Self>) {
        let result = self.output.take().ok_or_else(|| {
            ControllerError::Internal(format!("Task {} completed without running", self.id))
        });
        self.state = if result.is_ok() { TaskState::Completed } else { TaskState::Failed };
        debug!(id = %self.id, task = self.task.name(), state = %self.state, "Task finished");
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }

    fn fail(mut self: Box<Self>, error: ControllerError) {
        self.state = TaskState::Failed;
        debug!(id = %self.id, task = self.task.name(), state = %self.state, %error, "Task finished");
        let _ = self.reply.send(Err(error));
    }
}
