//! switchyard-core — shared domain types for the Switchyard orchestrator.
//!
//! Defines the persisted domain model (targets, target groups, rollouts,
//! ledger entries), the legal rollout transition table, and configuration
//! parsing for switchyard.toml.

pub mod config;
pub mod types;

pub use config::{FileConfig, ProbeConfig, ProvisionConfig, RolloutConfig, ShiftConfig};
pub use types::*;
