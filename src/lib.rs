// src/lib.rs

//! Cluster controller for a replicated content-storage cluster.
//!
//! The controller tracks every storage and distributor node, gates operator
//! requested state changes behind redundancy safety checks, and publishes
//! versioned cluster states that the nodes acknowledge.

pub mod client;
pub mod cluster;
pub mod common;
pub mod controller;
pub mod server;
