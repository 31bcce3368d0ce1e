// src/cluster/group.rs

//! Hierarchical node placement.
//!
//! Groups form a tree (for example switches holding racks). Every configured
//! node index is a leaf member of exactly one group, and each leaf carries the
//! redundancy floor used by the safety checker.

use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};
use crate::common::error::{ControllerError, Result};

/// Group tree as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group name, unique among its siblings
    pub name: String,
    /// Minimum number of available nodes required in this group; inherited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_redundancy: Option<usize>,
    /// Node indices held by this group (leaf groups only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<u16>,
    /// Child groups (inner groups only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupConfig>,
}

impl GroupConfig {
    /// A single root group holding all the given nodes
    pub fn flat(nodes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            name: "root".to_string(),
            min_redundancy: None,
            nodes: nodes.into_iter().collect(),
            groups: Vec::new(),
        }
    }
}

/// A frozen group of the tree
#[derive(Debug, Clone, Serialize)]
pub struct Group {
    name: String,
    path: String,
    min_redundancy: usize,
    nodes: Vec<u16>,
    subgroups: Vec<Group>,
}

impl Group {
    /// Builds the frozen tree. The root keeps its own name as path and child paths
    /// are joined below it without the root name, e.g. `switch1/rack2`.
    pub fn build(config: &GroupConfig, default_redundancy: usize) -> Result<Group> {
        let mut seen = BTreeSet::new();
        Self::build_inner(config, None, default_redundancy, &mut seen)
    }

    fn build_inner(
        config: &GroupConfig,
        parent_path: Option<&str>,
        inherited_redundancy: usize,
        seen: &mut BTreeSet<u16>,
    ) -> Result<Group> {
        if config.name.is_empty() || config.name.contains('/') {
            return Err(ControllerError::InvalidInput(format!(
                "Invalid group name '{}'", config.name
            )));
        }
        if !config.nodes.is_empty() && !config.groups.is_empty() {
            return Err(ControllerError::InvalidInput(format!(
                "Group '{}' has both nodes and subgroups; nodes must be placed in leaf groups",
                config.name
            )));
        }

        let path = match parent_path {
            None => config.name.clone(),
            Some(parent) if parent.is_empty() => config.name.clone(),
            Some(parent) => format!("{}/{}", parent, config.name),
        };
        let min_redundancy = config.min_redundancy.unwrap_or(inherited_redundancy);
        if min_redundancy == 0 {
            return Err(ControllerError::InvalidInput(format!(
                "Group '{}' has a redundancy of zero", path
            )));
        }

        for index in &config.nodes {
            if !seen.insert(*index) {
                return Err(ControllerError::InvalidInput(format!(
                    "Node {} is placed in more than one group", index
                )));
            }
        }

        // Children of the root are addressed without the root name
        let child_parent = if parent_path.is_none() { "" } else { path.as_str() };
        let mut names = BTreeSet::new();
        let mut subgroups = Vec::with_capacity(config.groups.len());
        for child in &config.groups {
            if !names.insert(child.name.as_str()) {
                return Err(ControllerError::InvalidInput(format!(
                    "Duplicate group name '{}' under '{}'", child.name, path
                )));
            }
            subgroups.push(Self::build_inner(child, Some(child_parent), min_redundancy, seen)?);
        }

        let mut nodes = config.nodes.clone();
        nodes.sort_unstable();

        Ok(Group {
            name: config.name.clone(),
            path,
            min_redundancy,
            nodes,
            subgroups,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn min_redundancy(&self) -> usize {
        self.min_redundancy
    }

    pub fn nodes(&self) -> &[u16] {
        &self.nodes
    }

    pub fn subgroups(&self) -> &[Group] {
        &self.subgroups
    }

    pub fn is_leaf(&self) -> bool {
        self.subgroups.is_empty()
    }

    /// All leaf groups in depth-first order
    pub fn leaves(&self) -> Vec<&Group> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Group>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for group in &self.subgroups {
                group.collect_leaves(out);
            }
        }
    }

    /// Map from node index to the leaf group holding it
    pub fn leaf_index(&self) -> BTreeMap<u16, &Group> {
        let mut index = BTreeMap::new();
        for leaf in self.leaves() {
            for node in &leaf.nodes {
                index.insert(*node, leaf);
            }
        }
        index
    }

    pub fn find(&self, path: &str) -> Option<&Group> {
        if self.path == path {
            return Some(self);
        }
        self.subgroups.iter().find_map(|group| group.find(path))
    }
}
