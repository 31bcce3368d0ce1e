// src/cluster/topology.rs

//! Topology sources.
//!
//! The controller does not own the cluster configuration; it pulls it from a
//! topology source at startup and whenever a reload is requested.

use std::path::PathBuf;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use crate::common::error::{ControllerError, Result};
use super::config::ControllerConfig;

/// Supplies the configured node set and group tree
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Load the current topology
    async fn load(&self) -> Result<ControllerConfig>;
}

/// Topology read from a JSON configuration file
pub struct FileTopologySource {
    path: PathBuf,
}

impl FileTopologySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TopologySource for FileTopologySource {
    async fn load(&self) -> Result<ControllerConfig> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ControllerError::Internal(format!(
                "Failed to read topology from {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let config = ControllerConfig::from_json(&content)?;
        debug!(path = %self.path.display(), nodes = config.nodes.len(), "Loaded topology");
        Ok(config)
    }
}

/// In-memory topology, replaced explicitly
pub struct StaticTopologySource {
    config: RwLock<ControllerConfig>,
}

impl StaticTopologySource {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replace the topology returned by subsequent loads
    pub async fn replace(&self, config: ControllerConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().await = config;
        Ok(())
    }
}

#[async_trait]
impl TopologySource for StaticTopologySource {
    async fn load(&self) -> Result<ControllerConfig> {
        Ok(self.config.read().await.clone())
    }
}
