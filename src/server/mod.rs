// src/server/mod.rs

//! Admin server of the cluster controller.
//!
//! Speaks line-delimited JSON over TCP: one request object per line, one
//! `{status, data}` response per line. A set-state request that changes
//! nothing is a valid outcome and is answered with status `ok`.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use crate::cluster::{Condition, Node, NodeState, State, user_state};
use crate::common::error::{ControllerError, Result};
use crate::controller::{
    ControllerHandle, QueryScope, ResponseWait, SetClusterStateTask, SetNodeStateTask,
    StateQueryTask,
};

/// One admin request. Which fields are needed depends on the command.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AdminRequest {
    pub command: String,
    /// Node identifier such as `storage.3`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// `safe` or `force`; force when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_wait: Option<ResponseWait>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_metrics: Option<Value>,
}

impl AdminRequest {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerResponse {
    pub status: String,
    pub data: Option<Value>,
}

impl ServerResponse {
    fn ok(data: Option<Value>) -> Self {
        ServerResponse { status: "ok".to_string(), data }
    }

    fn error(e: &ControllerError) -> Self {
        ServerResponse {
            status: "error".to_string(),
            data: Some(json!({
                "kind": e.kind(),
                "message": e.to_string(),
                "retryable": e.is_retryable(),
            })),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

fn required_node(request: &AdminRequest) -> Result<Node> {
    request
        .node
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidInput(format!("Command {} requires a node", request.command)))?
        .parse()
}

fn required_state(request: &AdminRequest) -> Result<&str> {
    request
        .state
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidInput(format!("Command {} requires a state", request.command)))
}

fn condition(request: &AdminRequest) -> Result<Condition> {
    request.condition.as_deref().map_or(Ok(Condition::Force), str::parse)
}

async fn execute(handle: &ControllerHandle, request: AdminRequest) -> Result<Value> {
    match request.command.as_str() {
        "get_cluster" => {
            let view = handle.submit(StateQueryTask::new(QueryScope::Cluster)).await?;
            Ok(serde_json::to_value(view)?)
        }
        "get_node" => {
            let node = required_node(&request)?;
            let view = handle.submit(StateQueryTask::new(QueryScope::Node(node))).await?;
            Ok(serde_json::to_value(view)?)
        }
        "set_node_state" => {
            let node = required_node(&request)?;
            let requested = user_state(required_state(&request)?, request.reason.as_deref().unwrap_or(""));
            let mut task = SetNodeStateTask::new(node, requested, condition(&request)?)
                .with_response_wait(request.response_wait.unwrap_or_default())
                .with_probe(request.probe.unwrap_or(false));
            if let Some(timeout_ms) = request.timeout_ms {
                task = task.with_timeout(Duration::from_millis(timeout_ms));
            }
            Ok(serde_json::to_value(handle.submit(task).await?)?)
        }
        "set_cluster_state" => {
            let requested = user_state(required_state(&request)?, request.reason.as_deref().unwrap_or(""));
            let mut task = SetClusterStateTask::new(requested, condition(&request)?)
                .with_response_wait(request.response_wait.unwrap_or_default())
                .with_probe(request.probe.unwrap_or(false));
            if let Some(timeout_ms) = request.timeout_ms {
                task = task.with_timeout(Duration::from_millis(timeout_ms));
            }
            Ok(serde_json::to_value(handle.submit(task).await?)?)
        }
        "report_state" => {
            let node = required_node(&request)?;
            let state: State = required_state(&request)?.parse()?;
            let reported = NodeState::new(state).with_description(request.reason.clone().unwrap_or_default());
            handle.report_state(node, reported, request.host_metrics).await?;
            Ok(json!({ "version": handle.published_state().version() }))
        }
        "ack_version" => {
            let node = required_node(&request)?;
            let version = request.version.ok_or_else(|| {
                ControllerError::InvalidInput("Command ack_version requires a version".to_string())
            })?;
            handle.acknowledge(node, version).await?;
            Ok(Value::Null)
        }
        other => Err(ControllerError::InvalidInput(format!("Unknown command: {}", other))),
    }
}

async fn handle_connection(stream: TcpStream, handle: ControllerHandle) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    debug!("Handling admin connection from {}", peer_addr);

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line_buffer = String::new();

    loop {
        line_buffer.clear();
        match reader.read_line(&mut line_buffer).await {
            Ok(0) => { debug!("Connection closed by peer {}", peer_addr); break; }
            Ok(_) => {
                let trimmed_line = line_buffer.trim();
                if trimmed_line.is_empty() { continue; }
                debug!("Received from {}: {}", peer_addr, trimmed_line);

                let response = match serde_json::from_str::<AdminRequest>(trimmed_line) {
                    Ok(request) => {
                        let command = request.command.clone();
                        match execute(&handle, request).await {
                            Ok(data) => ServerResponse::ok(Some(data)),
                            Err(e) => {
                                if e.is_retryable() {
                                    warn!("Command {} from {} failed: {}", command, peer_addr, e);
                                } else {
                                    debug!("Command {} from {} failed: {}", command, peer_addr, e);
                                }
                                ServerResponse::error(&e)
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to deserialize request from {}: {} (Line: '{}')", peer_addr, e, trimmed_line);
                        ServerResponse::error(&ControllerError::InvalidInput(format!("Invalid request format: {}", e)))
                    }
                };

                let response_json = serde_json::to_string(&response)?;
                if let Err(e) = write_half.write_all(response_json.as_bytes()).await { error!("Failed to write response to {}: {}", peer_addr, e); break; }
                if let Err(e) = write_half.write_all(b"\n").await { error!("Failed to write newline to {}: {}", peer_addr, e); break; }
                if let Err(e) = write_half.flush().await { error!("Failed to flush stream for {}: {}", peer_addr, e); break; }
                debug!("Sent to {}: {}", peer_addr, response_json);
            }
            Err(e) => { error!("Failed to read from connection {}: {}", peer_addr, e); break; }
        }
    }
    Ok(())
}

pub struct Server {
    handle: ControllerHandle,
    address: String,
}

impl Server {
    pub fn new(handle: ControllerHandle, address: impl Into<String>) -> Self {
        Server { handle, address: address.into() }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            ControllerError::Internal(format!("Failed to bind to address {}: {}", self.address, e))
        })?;
        info!("Admin server listening on {}", self.address);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("Accepted admin connection from: {}", addr);
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, handle).await {
                            error!("Error handling connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
}
