//! SimPlatform — in-memory compute and routing backend.
//!
//! Used by the scenario tests and the CLI's local mode. Failure behavior
//! is scriptable: provisioning can be rejected, targets can be made to
//! fail probes (from the start or after the fact), and weight updates
//! can fail transiently or permanently.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use switchyard_core::{GroupId, TargetId, UnitId};

use crate::api::{
    ComputePlatform, PlatformError, PlatformResult, ProvisionSpec, ProvisionedTarget, RoutingApi,
};

/// Scriptable failure behavior for the simulated platform.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Reject all provision requests with `CapacityRejected`.
    pub reject_provision: Option<String>,
    /// Artifact refs that fail resolution with `UnknownArtifact`.
    pub unknown_artifacts: HashSet<String>,
    /// Probes a target must receive before it reports healthy.
    pub healthy_after_probes: u32,
    /// All targets fail probes forever.
    pub never_healthy: bool,
    /// First N `provision` calls fail with `Transient`.
    pub transient_provision_failures: u32,
    /// First N `update_weights` calls fail with `Transient`.
    pub transient_weight_failures: u32,
    /// All `update_weights` calls fail with `RoutingRejected`.
    pub reject_weights: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            reject_provision: None,
            unknown_artifacts: HashSet::new(),
            healthy_after_probes: 1,
            never_healthy: false,
            transient_provision_failures: 0,
            transient_weight_failures: 0,
            reject_weights: false,
        }
    }
}

#[derive(Debug)]
struct SimTarget {
    unit_id: UnitId,
    group_id: GroupId,
    probes_seen: u32,
    terminated: bool,
}

#[derive(Debug, Default)]
struct SimState {
    targets: HashMap<TargetId, SimTarget>,
    weights: HashMap<UnitId, HashMap<GroupId, f64>>,
    /// Every weight map ever applied, per unit, in call order.
    weight_history: HashMap<UnitId, Vec<HashMap<GroupId, f64>>>,
    /// Groups whose targets currently fail probes.
    failing_groups: HashSet<GroupId>,
    provision_calls: u32,
    next_target: u64,
}

/// In-memory implementation of both platform traits.
pub struct SimPlatform {
    behavior: Mutex<SimBehavior>,
    state: Mutex<SimState>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::with_behavior(SimBehavior::default())
    }

    pub fn with_behavior(behavior: SimBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Replace the failure behavior mid-run.
    pub fn set_behavior(&self, behavior: SimBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Make all targets of a group fail probes from now on.
    pub fn fail_group(&self, group_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_groups
            .insert(group_id.to_string());
        debug!(%group_id, "sim: group now failing probes");
    }

    /// Number of `provision` calls the platform accepted or rejected.
    pub fn provision_calls(&self) -> u32 {
        self.state.lock().unwrap().provision_calls
    }

    /// Targets of a group that have not been terminated.
    pub fn live_targets_in_group(&self, group_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .targets
            .values()
            .filter(|t| t.group_id == group_id && !t.terminated)
            .count()
    }

    /// Currently applied weight map for a unit.
    pub fn weights(&self, unit_id: &str) -> HashMap<GroupId, f64> {
        self.state
            .lock()
            .unwrap()
            .weights
            .get(unit_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every weight map applied for a unit, oldest first.
    pub fn weight_history(&self, unit_id: &str) -> Vec<HashMap<GroupId, f64>> {
        self.state
            .lock()
            .unwrap()
            .weight_history
            .get(unit_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputePlatform for SimPlatform {
    async fn provision(&self, spec: &ProvisionSpec) -> PlatformResult<Vec<ProvisionedTarget>> {
        let behavior = {
            let mut behavior = self.behavior.lock().unwrap();
            if behavior.transient_provision_failures > 0 {
                behavior.transient_provision_failures -= 1;
                self.state.lock().unwrap().provision_calls += 1;
                return Err(PlatformError::Transient(
                    "compute platform briefly unavailable".to_string(),
                ));
            }
            behavior.clone()
        };
        let mut state = self.state.lock().unwrap();
        state.provision_calls += 1;

        if let Some(reason) = &behavior.reject_provision {
            return Err(PlatformError::CapacityRejected(reason.clone()));
        }
        if behavior.unknown_artifacts.contains(&spec.artifact_ref) {
            return Err(PlatformError::UnknownArtifact(spec.artifact_ref.clone()));
        }

        let mut provisioned = Vec::with_capacity(spec.size as usize);
        for _ in 0..spec.size {
            let n = state.next_target;
            state.next_target += 1;
            let id = format!("sim-target-{n}");
            let address = format!("10.0.{}.{}:8080", n / 250, n % 250 + 1);
            state.targets.insert(
                id.clone(),
                SimTarget {
                    unit_id: spec.unit_id.clone(),
                    group_id: spec.group_id.clone(),
                    probes_seen: 0,
                    terminated: false,
                },
            );
            provisioned.push(ProvisionedTarget { id, address });
        }
        debug!(
            unit_id = %spec.unit_id,
            group_id = %spec.group_id,
            size = spec.size,
            "sim: provisioned targets"
        );
        Ok(provisioned)
    }

    async fn terminate(&self, target_ids: &[TargetId]) -> PlatformResult<()> {
        let mut state = self.state.lock().unwrap();
        for id in target_ids {
            // Unknown ids are ignored; termination is idempotent.
            if let Some(target) = state.targets.get_mut(id) {
                target.terminated = true;
            }
        }
        Ok(())
    }

    async fn probe_health(&self, target_id: &TargetId) -> PlatformResult<bool> {
        let behavior = self.behavior.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        let failing = state.failing_groups.clone();
        let Some(target) = state.targets.get_mut(target_id) else {
            return Err(PlatformError::Transient(format!(
                "no such target: {target_id}"
            )));
        };
        if target.terminated {
            return Ok(false);
        }
        if behavior.never_healthy || failing.contains(&target.group_id) {
            return Ok(false);
        }
        target.probes_seen += 1;
        Ok(target.probes_seen >= behavior.healthy_after_probes)
    }
}

#[async_trait]
impl RoutingApi for SimPlatform {
    async fn update_weights(
        &self,
        unit_id: &str,
        weights: &HashMap<GroupId, f64>,
    ) -> PlatformResult<()> {
        {
            let mut behavior = self.behavior.lock().unwrap();
            if behavior.reject_weights {
                return Err(PlatformError::RoutingRejected(format!(
                    "weight update refused for {unit_id}"
                )));
            }
            if behavior.transient_weight_failures > 0 {
                behavior.transient_weight_failures -= 1;
                return Err(PlatformError::Transient(
                    "load balancer briefly unavailable".to_string(),
                ));
            }
        }

        let mut state = self.state.lock().unwrap();
        state
            .weights
            .insert(unit_id.to_string(), weights.clone());
        state
            .weight_history
            .entry(unit_id.to_string())
            .or_default()
            .push(weights.clone());
        debug!(%unit_id, ?weights, "sim: weights applied");
        Ok(())
    }

    async fn get_weights(&self, unit_id: &str) -> PlatformResult<HashMap<GroupId, f64>> {
        Ok(self.weights(unit_id))
    }
}
