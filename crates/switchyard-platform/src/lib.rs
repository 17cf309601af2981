//! switchyard-platform — the seam between Switchyard and the cloud
//! control plane.
//!
//! The orchestrator core depends on, but does not implement, the compute
//! platform (provision/terminate/probe) and the load balancer (weighted
//! routing). Both are expressed as async traits here so real adapters
//! can be plugged in; `SimPlatform` is the in-memory implementation used
//! by tests and the CLI's local mode.

pub mod api;
pub mod sim;

pub use api::{
    ComputePlatform, PlatformError, PlatformResult, ProvisionSpec, ProvisionedTarget, RoutingApi,
};
pub use sim::{SimBehavior, SimPlatform};
