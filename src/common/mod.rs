//! Shared types used across the controller.

pub mod error;
