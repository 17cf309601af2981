//! Platform traits — the seam between the orchestrator and the cloud
//! control plane.
//!
//! The orchestrator never assumes a platform write lands faster than its
//! explicitly polled confirmation; both traits are modeled as
//! eventually-consistent request/observe pairs.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use switchyard_core::{GroupId, TargetId};

/// Result type alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors surfaced by the compute and routing collaborators.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform refused to allocate capacity (quota, limits).
    #[error("capacity rejected: {0}")]
    CapacityRejected(String),

    /// The artifact reference could not be resolved to a pullable image.
    #[error("unknown artifact: {0}")]
    UnknownArtifact(String),

    /// The load balancer rejected a weight update.
    #[error("routing rejected: {0}")]
    RoutingRejected(String),

    /// A retryable failure (timeout, 5xx) from the platform.
    #[error("transient platform error: {0}")]
    Transient(String),
}

impl PlatformError {
    /// Whether callers should retry with backoff before giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Request to provision one target group's worth of capacity.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub unit_id: String,
    /// Group the platform tags the new capacity with.
    pub group_id: GroupId,
    pub artifact_ref: String,
    pub size: u32,
}

/// A compute unit the platform brought up for a provision request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedTarget {
    pub id: TargetId,
    /// Address the target serves (and is probed) on.
    pub address: String,
}

/// Compute control plane: provisions, terminates, and probes targets.
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    /// Provision `spec.size` targets running `spec.artifact_ref`.
    ///
    /// Returns once the platform has accepted the request and assigned
    /// addresses; targets are not necessarily serving yet — health
    /// convergence is the prober's job.
    async fn provision(&self, spec: &ProvisionSpec) -> PlatformResult<Vec<ProvisionedTarget>>;

    /// Terminate the given targets. Unknown ids are ignored, which
    /// makes group teardown idempotent.
    async fn terminate(&self, target_ids: &[TargetId]) -> PlatformResult<()>;

    /// Probe one target's health endpoint. `Ok(false)` is a served
    /// negative answer; `Err` means the probe itself failed.
    async fn probe_health(&self, target_id: &TargetId) -> PlatformResult<bool>;
}

/// Load balancer control plane: weighted routing between target groups.
#[async_trait]
pub trait RoutingApi: Send + Sync {
    /// Replace the weight map for a unit. Fractions are in [0, 1] and
    /// are expected to sum to 1 across groups.
    async fn update_weights(
        &self,
        unit_id: &str,
        weights: &HashMap<GroupId, f64>,
    ) -> PlatformResult<()>;

    /// Observe the currently applied weight map. May lag a recent
    /// `update_weights`; callers poll until it converges.
    async fn get_weights(&self, unit_id: &str) -> PlatformResult<HashMap<GroupId, f64>>;
}
