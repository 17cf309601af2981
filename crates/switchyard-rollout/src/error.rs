//! Rollout orchestrator error types.

use thiserror::Error;

use switchyard_core::RolloutState;

/// Result type alias for orchestrator operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors surfaced by the rollout orchestrator.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// A rollout is already in flight for the unit. Rejected
    /// synchronously with no state mutation.
    #[error("rollout already in flight for unit {0}")]
    Conflict(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rollout not found: {0}")]
    NotFound(String),

    /// The requested operation is not legal in the rollout's current
    /// state (e.g. cancelling a terminal rollout).
    #[error("rollout {id} is in state {state}, operation not allowed")]
    InvalidState { id: String, state: RolloutState },

    /// The durable store failed. Fail-closed: no transition proceeds
    /// un-audited.
    #[error("state store error: {0}")]
    State(#[from] switchyard_state::StateError),

    #[error(transparent)]
    Registry(#[from] switchyard_registry::RegistryError),
}
