// src/cluster/config.rs

//! Controller and topology configuration.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use crate::common::error::{ControllerError, Result};
use super::group::{Group, GroupConfig};

/// A configured node index. Each index yields one storage and one distributor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredNode {
    pub index: u16,
    /// Retired nodes are drained: they are published as retired while up
    #[serde(default)]
    pub retired: bool,
}

impl ConfiguredNode {
    pub fn new(index: u16) -> Self {
        Self { index, retired: false }
    }
}

/// A bucket space and the storage nodes carrying it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpaceConfig {
    pub name: String,
    /// Storage node indices serving this space; every node when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_nodes: Option<Vec<u16>>,
}

impl BucketSpaceConfig {
    pub fn all_nodes(name: &str) -> Self {
        Self {
            name: name.to_string(),
            storage_nodes: None,
        }
    }
}

fn default_redundancy() -> usize {
    2
}

fn default_bucket_spaces() -> Vec<BucketSpaceConfig> {
    vec![BucketSpaceConfig::all_nodes("default"), BucketSpaceConfig::all_nodes("global")]
}

fn default_master_moratorium_secs() -> u64 {
    10
}

fn default_ack_check_interval_ms() -> u64 {
    100
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_min_up_count() -> usize {
    1
}

fn default_admin_addr() -> String {
    "127.0.0.1:19050".to_string()
}

/// Configuration of one cluster controller and the content cluster it manages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name of the content cluster
    pub cluster_name: String,
    /// Index of this controller among the controllers of the cluster
    #[serde(default)]
    pub controller_index: u16,
    /// Default redundancy floor for groups without their own
    #[serde(default = "default_redundancy")]
    pub redundancy: usize,
    /// Configured node indices
    pub nodes: Vec<ConfiguredNode>,
    /// Group tree; a single flat group when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupConfig>,
    /// Bucket spaces with a derived cluster state each
    #[serde(default = "default_bucket_spaces")]
    pub bucket_spaces: Vec<BucketSpaceConfig>,
    /// Time after gaining mastership during which wanted state changes are refused
    #[serde(default = "default_master_moratorium_secs")]
    pub master_moratorium_secs: u64,
    /// How often pending version acknowledgement waits are re-evaluated
    #[serde(default = "default_ack_check_interval_ms")]
    pub ack_check_interval_ms: u64,
    /// How long a request without its own timeout waits for acknowledgements
    #[serde(default = "default_ack_timeout_ms")]
    pub default_ack_timeout_ms: u64,
    /// Minimum available storage nodes for the cluster to be up
    #[serde(default = "default_min_up_count")]
    pub min_storage_up_count: usize,
    /// Minimum up distributors for the cluster to be up
    #[serde(default = "default_min_up_count")]
    pub min_distributor_up_count: usize,
    /// Address of the admin server
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

impl ControllerConfig {
    /// A configuration with defaults for everything but the nodes
    pub fn new(cluster_name: &str, nodes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            controller_index: 0,
            redundancy: default_redundancy(),
            nodes: nodes.into_iter().map(ConfiguredNode::new).collect(),
            group: None,
            bucket_spaces: default_bucket_spaces(),
            master_moratorium_secs: default_master_moratorium_secs(),
            ack_check_interval_ms: default_ack_check_interval_ms(),
            default_ack_timeout_ms: default_ack_timeout_ms(),
            min_storage_up_count: default_min_up_count(),
            min_distributor_up_count: default_min_up_count(),
            admin_addr: default_admin_addr(),
        }
    }

    /// Load a controller configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ControllerError::Internal(format!("Failed to read controller config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate a configuration from JSON
    pub fn from_json(content: &str) -> Result<Self> {
        let config: ControllerConfig = serde_json::from_str(content)
            .map_err(|e| ControllerError::InvalidInput(format!("Failed to parse controller config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save a controller configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn master_moratorium(&self) -> Duration {
        Duration::from_secs(self.master_moratorium_secs)
    }

    pub fn ack_check_interval(&self) -> Duration {
        Duration::from_millis(self.ack_check_interval_ms.max(1))
    }

    pub fn default_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ack_timeout_ms)
    }

    /// The configured group tree, or a flat group over every node
    pub fn group_config(&self) -> GroupConfig {
        self.group
            .clone()
            .unwrap_or_else(|| GroupConfig::flat(self.nodes.iter().map(|n| n.index)))
    }

    /// Build the frozen group tree
    pub fn build_groups(&self) -> Result<Group> {
        Group::build(&self.group_config(), self.redundancy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(ControllerError::InvalidInput("Cluster name must not be empty".to_string()));
        }
        if self.redundancy == 0 {
            return Err(ControllerError::InvalidInput("Redundancy must be at least 1".to_string()));
        }

        let mut indices = BTreeSet::new();
        for node in &self.nodes {
            if !indices.insert(node.index) {
                return Err(ControllerError::InvalidInput(format!(
                    "Node index {} is configured more than once", node.index
                )));
            }
        }

        let groups = self.build_groups()?;
        let placed = groups.leaf_index();
        for index in &indices {
            if !placed.contains_key(index) {
                return Err(ControllerError::InvalidInput(format!(
                    "Node {} is not placed in any group", index
                )));
            }
        }
        for index in placed.keys() {
            if !indices.contains(index) {
                return Err(ControllerError::InvalidInput(format!(
                    "Group '{}' holds node {} which is not configured",
                    placed[index].path(),
                    index
                )));
            }
        }

        let mut spaces = BTreeSet::new();
        for space in &self.bucket_spaces {
            if !spaces.insert(space.name.as_str()) {
                return Err(ControllerError::InvalidInput(format!(
                    "Bucket space '{}' is configured more than once", space.name
                )));
            }
        }

        Ok(())
    }
}
