//! switchyard-registry — target group lifecycle for Switchyard.
//!
//! Creates, enumerates, and tears down `TargetGroup`s against the
//! compute platform, persisting group records to the state store.
//! Teardown is idempotent; transient platform failures are retried with
//! bounded backoff before surfacing to the rollout state machine.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::TargetRegistry;
