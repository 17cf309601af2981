//! Traffic shifter — weighted routing updates at the load-balancer seam.
//!
//! Weight updates are requested, then confirmed by polling, because the
//! routing layer applies changes asynchronously. Updates are retried a
//! bounded number of times with doubling backoff; exhaustion escalates
//! to the rollout state machine as a rollback trigger.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_core::{GroupId, ShiftConfig};
use switchyard_platform::RoutingApi;

use crate::ramp::SPLIT_EPSILON;

/// Result type alias for traffic operations.
pub type TrafficResult<T> = Result<T, TrafficError>;

/// Errors from the traffic shifter.
#[derive(Debug, Error)]
pub enum TrafficError {
    /// The load balancer rejected or kept failing a weight update.
    #[error("routing update failed: {0}")]
    Routing(String),

    /// The observed split never converged to the requested one.
    #[error("split confirmation timed out: requested {requested}, observed {observed}")]
    ConfirmTimeout { requested: f64, observed: f64 },
}

/// Moves routed traffic share between active and candidate groups.
pub struct TrafficShifter {
    routing: Arc<dyn RoutingApi>,
    config: ShiftConfig,
}

impl TrafficShifter {
    pub fn new(routing: Arc<dyn RoutingApi>, config: ShiftConfig) -> Self {
        Self { routing, config }
    }

    /// Request that `fraction` of traffic route to the candidate group,
    /// the remainder to the active group (if one exists).
    ///
    /// Retries up to the configured limit with doubling backoff, then
    /// fails with `TrafficError::Routing`.
    pub async fn set_split(
        &self,
        unit_id: &str,
        active_group: Option<&str>,
        candidate_group: &str,
        fraction: f64,
    ) -> TrafficResult<()> {
        let mut weights: HashMap<GroupId, f64> = HashMap::new();
        weights.insert(candidate_group.to_string(), fraction);
        if let Some(active) = active_group {
            weights.insert(active.to_string(), 1.0 - fraction);
        }

        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.routing.update_weights(unit_id, &weights).await {
                Ok(()) => {
                    info!(%unit_id, %candidate_group, fraction, "weight update requested");
                    return Ok(());
                }
                Err(e) if attempt < self.config.retry_limit => {
                    attempt += 1;
                    warn!(%unit_id, %e, attempt, "weight update failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(TrafficError::Routing(e.to_string())),
            }
        }
    }

    /// The last confirmed fraction of traffic on the candidate group.
    ///
    /// May lag a recent `set_split`; use `confirm_split` to wait for
    /// convergence before proceeding.
    pub async fn current_split(&self, unit_id: &str, candidate_group: &str) -> TrafficResult<f64> {
        let weights = self
            .routing
            .get_weights(unit_id)
            .await
            .map_err(|e| TrafficError::Routing(e.to_string()))?;
        Ok(weights.get(candidate_group).copied().unwrap_or(0.0))
    }

    /// Poll until the observed candidate split matches `requested`.
    pub async fn confirm_split(
        &self,
        unit_id: &str,
        candidate_group: &str,
        requested: f64,
    ) -> TrafficResult<()> {
        let deadline = Instant::now() + self.config.confirm_timeout;
        let mut observed = self.current_split(unit_id, candidate_group).await?;
        loop {
            if (observed - requested).abs() <= SPLIT_EPSILON {
                debug!(%unit_id, requested, "split confirmed");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TrafficError::ConfirmTimeout {
                    requested,
                    observed,
                });
            }
            tokio::time::sleep(self.config.confirm_interval).await;
            observed = self.current_split(unit_id, candidate_group).await?;
        }
    }

    /// Reset the candidate to zero traffic in a single step.
    ///
    /// Rollback never ramps down; the point is to stop damage quickly.
    pub async fn reset(
        &self,
        unit_id: &str,
        active_group: Option<&str>,
        candidate_group: &str,
    ) -> TrafficResult<()> {
        self.set_split(unit_id, active_group, candidate_group, 0.0)
            .await
    }
}
