//! Domain types shared across Switchyard crates.
//!
//! These types represent the persisted state of rollouts, target groups,
//! and ledger entries. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a deployable unit (the logical service).
pub type UnitId = String;

/// Unique identifier for a target group within a unit.
pub type GroupId = String;

/// Unique identifier for a target within a group.
pub type TargetId = String;

/// Unique identifier for a rollout attempt.
pub type RolloutId = String;

// ── Targets ───────────────────────────────────────────────────────

/// Health of a single target as determined by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHealth {
    /// No probe has converged yet.
    Unknown,
    Healthy,
    Unhealthy,
    /// Traffic removed, awaiting termination.
    Draining,
}

/// A single compute unit capable of serving traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: TargetId,
    pub group_id: GroupId,
    /// Probe endpoint address (ip:port).
    pub address: String,
    pub health: TargetHealth,
    /// Share of routed traffic on this target, in [0, 1].
    pub weight: f64,
}

// ── Target groups ─────────────────────────────────────────────────

/// Which side of a blue/green pair a group is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    /// Serving production traffic at rest.
    Active,
    /// Newly provisioned capacity under evaluation.
    Candidate,
}

/// A versioned pool of targets representing one side of a blue/green pair.
///
/// Outside an in-flight rollout exactly one group per unit holds
/// `Active`; during a rollout one `Active` and one `Candidate` coexist.
/// Only the owning rollout's control loop mutates `role`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetGroup {
    pub id: GroupId,
    pub unit_id: UnitId,
    /// Artifact (image/version) this group runs.
    pub artifact_ref: String,
    pub role: GroupRole,
    pub targets: Vec<Target>,
    /// Unix timestamp in milliseconds; orders groups oldest-first.
    pub created_at: u64,
}

impl TargetGroup {
    /// Composite key for the target groups table.
    pub fn table_key(&self) -> String {
        group_key(&self.unit_id, &self.id)
    }
}

/// Build the composite `{unit_id}:{group_id}` key.
pub fn group_key(unit_id: &str, group_id: &str) -> String {
    format!("{unit_id}:{group_id}")
}

// ── Rollouts ──────────────────────────────────────────────────────

/// State of a rollout attempt.
///
/// Terminal states (`ProvisionFailed`, `Complete`, `RolledBack`) are
/// immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Requested,
    Provisioning,
    ProvisionFailed,
    HealthChecking,
    Shifting,
    Draining,
    Complete,
    UnhealthyRollback,
    ShiftFailedRollback,
    RolledBack,
}

impl RolloutState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ProvisionFailed | Self::Complete | Self::RolledBack
        )
    }

    /// Whether this state represents a failed attempt.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ProvisionFailed
                | Self::UnhealthyRollback
                | Self::ShiftFailedRollback
                | Self::RolledBack
        )
    }

    /// The legal transition table for the rollout state machine.
    ///
    /// Self-loops on `HealthChecking` (re-poll) and `Shifting` (next
    /// ramp step) are legal; everything else is a strict progression.
    pub fn can_transition_to(self, next: RolloutState) -> bool {
        use RolloutState::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Provisioning, ProvisionFailed)
                | (Provisioning, HealthChecking)
                | (HealthChecking, HealthChecking)
                | (HealthChecking, UnhealthyRollback)
                | (HealthChecking, Shifting)
                | (Shifting, Shifting)
                | (Shifting, ShiftFailedRollback)
                | (Shifting, Draining)
                | (Draining, Complete)
                | (UnhealthyRollback, RolledBack)
                | (ShiftFailedRollback, RolledBack)
        )
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::ProvisionFailed => "provision_failed",
            Self::HealthChecking => "health_checking",
            Self::Shifting => "shifting",
            Self::Draining => "draining",
            Self::Complete => "complete",
            Self::UnhealthyRollback => "unhealthy_rollback",
            Self::ShiftFailedRollback => "shift_failed_rollback",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Error taxonomy code recorded on failed rollouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Platform rejected candidate capacity.
    ProvisionRejected,
    /// Candidate never converged to healthy within budget.
    HealthTimeout,
    /// Candidate reported unhealthy.
    CandidateUnhealthy,
    /// Load balancer rejected or failed to confirm a weight update.
    RoutingRejected,
    /// Operator cancelled the rollout.
    Cancelled,
}

/// One deployment attempt. Mutated only by its owning control loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub unit_id: UnitId,
    pub artifact_ref: String,
    /// Number of targets to provision for the candidate group.
    pub group_size: u32,
    pub state: RolloutState,
    pub active_group_id: Option<GroupId>,
    pub candidate_group_id: Option<GroupId>,
    /// Fraction of traffic currently on the candidate, in [0, 1].
    pub traffic_split: f64,
    /// Unix timestamp in milliseconds.
    pub started_at: u64,
    /// Unix timestamp in milliseconds of the last state change.
    pub last_transition_at: u64,
    /// Retry counter across resume attempts.
    pub attempts: u32,
    pub failure_reason: Option<FailureReason>,
    /// Set by `cancel`; the control loop observes it at its next
    /// suspension point.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Rollout {
    pub fn new(id: RolloutId, unit_id: UnitId, artifact_ref: String, group_size: u32) -> Self {
        let now = now_millis();
        Self {
            id,
            unit_id,
            artifact_ref,
            group_size,
            state: RolloutState::Requested,
            active_group_id: None,
            candidate_group_id: None,
            traffic_split: 0.0,
            started_at: now,
            last_transition_at: now,
            attempts: 1,
            failure_reason: None,
            cancel_requested: false,
        }
    }
}

// ── Ledger ────────────────────────────────────────────────────────

/// Immutable record of one rollout state transition.
///
/// Entries are append-only and never mutated or deleted. The zero-padded
/// sequence number makes redb key order equal time order per unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub rollout_id: RolloutId,
    pub unit_id: UnitId,
    /// Monotonic sequence number within the unit's ledger.
    pub seq: u64,
    /// `None` for the entry recording rollout creation.
    pub from: Option<RolloutState>,
    pub to: RolloutState,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub detail: String,
}

impl LedgerEntry {
    /// Composite key for the ledger table, `{unit_id}:{seq:010}`.
    pub fn table_key(&self) -> String {
        ledger_key(&self.unit_id, self.seq)
    }
}

/// Build the zero-padded ledger key for a unit and sequence number.
pub fn ledger_key(unit_id: &str, seq: u64) -> String {
    format!("{unit_id}:{seq:010}")
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
