//! switchyard-rollout — the blue/green rollout state machine.
//!
//! The `Orchestrator` ties the registry, prober, and shifter together
//! into one control loop per in-flight rollout:
//!
//! ```text
//! Requested → Provisioning → HealthChecking → Shifting → Draining → Complete
//!                  │               │              │
//!                  ▼               ▼              ▼
//!          ProvisionFailed  UnhealthyRollback  ShiftFailedRollback
//!                                  └──────┬───────┘
//!                                         ▼
//!                                     RolledBack
//! ```
//!
//! Single-flight per unit, append-only ledger auditing of every
//! transition, crash recovery via `resume`, and operator cancellation
//! are all handled here.

pub mod error;
pub mod orchestrator;

pub use error::{RolloutError, RolloutResult};
pub use orchestrator::Orchestrator;
