//! Target registry error types.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur while managing target groups.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The platform could not create candidate capacity. Fatal to the
    /// rollout attempt; callers may retry with a fresh rollout.
    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("target group not found: {0}")]
    GroupNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] switchyard_state::StateError),
}
