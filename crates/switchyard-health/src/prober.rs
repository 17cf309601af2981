//! Health prober — background probing of target groups.
//!
//! The prober spawns one background task per target group that probes
//! every member on a fixed interval, feeds results through per-target
//! `ProbeTracker`s, and writes health changes back to the state store.
//! Aggregate health is derived on demand, never stored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use switchyard_core::{GroupId, ProbeConfig, Target, TargetGroup, TargetHealth, UnitId};
use switchyard_platform::ComputePlatform;
use switchyard_state::{StateResult, StateStore};

use crate::tracker::{ProbeOutcome, ProbeTracker};

/// How a single target is probed. Implemented over HTTP for real
/// targets and over the compute platform for simulated ones.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self, target: &Target) -> ProbeOutcome;
}

/// Probe transport that delegates to `ComputePlatform::probe_health`.
pub struct PlatformProbeTransport {
    platform: Arc<dyn ComputePlatform>,
}

impl PlatformProbeTransport {
    pub fn new(platform: Arc<dyn ComputePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl ProbeTransport for PlatformProbeTransport {
    async fn probe(&self, target: &Target) -> ProbeOutcome {
        match self.platform.probe_health(&target.id).await {
            Ok(true) => ProbeOutcome::Pass,
            Ok(false) => ProbeOutcome::Fail,
            Err(e) => {
                debug!(target_id = %target.id, %e, "platform probe errored");
                ProbeOutcome::Error
            }
        }
    }
}

/// Aggregate health of a target group, derived from member targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateHealth {
    /// Every target is healthy.
    Healthy,
    /// Some targets are not healthy, but not enough to condemn the group.
    Degraded,
    /// More than half the targets are unhealthy (or unknown past the
    /// grace period).
    Unhealthy,
}

/// Derive aggregate health from member target healths.
///
/// `grace_elapsed` controls whether `Unknown` targets count against the
/// group: before the grace period they are tolerated (still converging),
/// after it they are as bad as unhealthy.
pub fn aggregate(healths: &[TargetHealth], grace_elapsed: bool) -> AggregateHealth {
    if healths.is_empty() {
        return AggregateHealth::Unhealthy;
    }
    if healths.iter().all(|h| *h == TargetHealth::Healthy) {
        return AggregateHealth::Healthy;
    }
    let bad = healths
        .iter()
        .filter(|h| match h {
            TargetHealth::Unhealthy | TargetHealth::Draining => true,
            TargetHealth::Unknown => grace_elapsed,
            TargetHealth::Healthy => false,
        })
        .count();
    if bad * 2 > healths.len() {
        AggregateHealth::Unhealthy
    } else {
        AggregateHealth::Degraded
    }
}

/// Per-group probe task state.
struct ProbeSlot {
    unit_id: UnitId,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

/// Manages background probe tasks for all subscribed target groups.
pub struct HealthProber {
    state: StateStore,
    transport: Arc<dyn ProbeTransport>,
    config: ProbeConfig,
    /// Active probe tasks: group_id → slot.
    monitors: Arc<RwLock<HashMap<GroupId, ProbeSlot>>>,
}

impl HealthProber {
    pub fn new(state: StateStore, transport: Arc<dyn ProbeTransport>, config: ProbeConfig) -> Self {
        Self {
            state,
            transport,
            config,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Begin probing a group's targets.
    ///
    /// Idempotent subscribe: starting an already-probed group leaves the
    /// existing task (and its tracker state) untouched.
    pub async fn start_probing(&self, group: &TargetGroup) {
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(&group.id) {
            debug!(group_id = %group.id, "already probing, subscribe is a no-op");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let unit_id = group.unit_id.clone();
        let group_id = group.id.clone();
        let state = self.state.clone();
        let transport = self.transport.clone();
        let config = self.config.clone();

        let task_group_id = group_id.clone();
        let task_unit_id = unit_id.clone();
        let handle = tokio::spawn(async move {
            run_probe_loop(
                &task_unit_id,
                &task_group_id,
                state,
                transport,
                config,
                shutdown_rx,
            )
            .await;
        });

        monitors.insert(
            group_id.clone(),
            ProbeSlot {
                unit_id,
                handle,
                shutdown_tx,
                started_at: Instant::now(),
            },
        );
        info!(%group_id, targets = group.targets.len(), "probing started");
    }

    /// Stop probing a group. Must be called when a group is destroyed
    /// so nonexistent targets are not probed.
    pub async fn stop_probing(&self, group_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(group_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%group_id, "probing stopped");
        }
    }

    /// Stop all probe tasks (for shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (group_id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%group_id, "probing stopped");
        }
    }

    /// Whether a probe task is running for the group.
    pub async fn is_probing(&self, group_id: &str) -> bool {
        self.monitors.read().await.contains_key(group_id)
    }

    /// Derive the group's aggregate health from stored target healths.
    ///
    /// The grace period runs from when probing started; a group that is
    /// not being probed gets no grace (stale `Unknown` counts against it).
    pub async fn aggregate_health(
        &self,
        unit_id: &str,
        group_id: &str,
    ) -> StateResult<AggregateHealth> {
        let grace_elapsed = {
            let monitors = self.monitors.read().await;
            match monitors.get(group_id) {
                Some(slot) if slot.unit_id == unit_id => {
                    slot.started_at.elapsed() >= self.config.grace_period
                }
                _ => true,
            }
        };
        let healths: Vec<TargetHealth> = match self.state.get_group(unit_id, group_id)? {
            Some(group) => group.targets.iter().map(|t| t.health).collect(),
            None => Vec::new(),
        };
        Ok(aggregate(&healths, grace_elapsed))
    }
}

/// The probe loop for a single target group.
///
/// Exits when the group record disappears from the store or the
/// shutdown signal fires.
async fn run_probe_loop(
    unit_id: &str,
    group_id: &str,
    state: StateStore,
    transport: Arc<dyn ProbeTransport>,
    config: ProbeConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut trackers: HashMap<String, ProbeTracker> = HashMap::new();

    debug!(%group_id, interval = ?config.interval, "probe loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {
                let group = match state.get_group(unit_id, group_id) {
                    Ok(Some(group)) => group,
                    Ok(None) => {
                        debug!(%group_id, "group gone, probe loop exiting");
                        break;
                    }
                    Err(e) => {
                        error!(%group_id, %e, "failed to load group, will retry");
                        continue;
                    }
                };

                let mut updates: Vec<(String, TargetHealth)> = Vec::new();
                for target in &group.targets {
                    if target.health == TargetHealth::Draining {
                        continue;
                    }
                    let outcome = transport.probe(target).await;
                    let tracker = trackers
                        .entry(target.id.clone())
                        .or_insert_with(|| ProbeTracker::new(&config));
                    let new_health = tracker.record(outcome);
                    if new_health != target.health {
                        updates.push((target.id.clone(), new_health));
                    }
                }

                // Health-only write; a concurrent role change on the
                // group record must not be clobbered with our stale copy.
                if !updates.is_empty() {
                    if let Err(e) = state.update_target_health(unit_id, group_id, &updates) {
                        warn!(%group_id, %e, "failed to persist target health");
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(%group_id, "probe loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchyard_core::GroupRole;
    use switchyard_platform::{SimBehavior, SimPlatform};

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            grace_period: Duration::from_millis(100),
            ..Default::default()
        }
    }

    /// Provision a group through the sim and persist its record.
    async fn seeded_group(
        sim: &SimPlatform,
        state: &StateStore,
        unit_id: &str,
        group_id: &str,
        size: u32,
    ) -> TargetGroup {
        let spec = switchyard_platform::ProvisionSpec {
            unit_id: unit_id.to_string(),
            group_id: group_id.to_string(),
            artifact_ref: "v1".to_string(),
            size,
        };
        let provisioned = sim.provision(&spec).await.unwrap();
        let group = TargetGroup {
            id: group_id.to_string(),
            unit_id: unit_id.to_string(),
            artifact_ref: "v1".to_string(),
            role: GroupRole::Candidate,
            targets: provisioned
                .into_iter()
                .map(|t| Target {
                    id: t.id,
                    group_id: group_id.to_string(),
                    address: t.address,
                    health: TargetHealth::Unknown,
                    weight: 0.0,
                })
                .collect(),
            created_at: 0,
        };
        state.put_group(&group).unwrap();
        group
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within budget");
    }

    #[test]
    fn aggregate_rules() {
        use AggregateHealth as A;
        use TargetHealth as T;

        assert_eq!(aggregate(&[], true), A::Unhealthy);
        assert_eq!(aggregate(&[T::Healthy, T::Healthy], true), A::Healthy);
        assert_eq!(aggregate(&[T::Healthy, T::Unhealthy], true), A::Degraded);
        assert_eq!(
            aggregate(&[T::Unhealthy, T::Unhealthy, T::Healthy], true),
            A::Unhealthy
        );
        // Unknown tolerated inside the grace period.
        assert_eq!(aggregate(&[T::Unknown, T::Unknown], false), A::Degraded);
        assert_eq!(aggregate(&[T::Unknown, T::Unknown], true), A::Unhealthy);
        assert_eq!(aggregate(&[T::Healthy, T::Unknown], false), A::Degraded);
    }

    #[tokio::test]
    async fn group_converges_to_healthy() {
        let sim = Arc::new(SimPlatform::new());
        let state = StateStore::open_in_memory().unwrap();
        let group = seeded_group(&sim, &state, "svc-a", "tg-1", 2).await;

        let transport = Arc::new(PlatformProbeTransport::new(sim.clone()));
        let prober = HealthProber::new(state.clone(), transport, fast_config());
        prober.start_probing(&group).await;

        let check_state = state.clone();
        wait_for(|| {
            check_state
                .get_group("svc-a", "tg-1")
                .unwrap()
                .unwrap()
                .targets
                .iter()
                .all(|t| t.health == TargetHealth::Healthy)
        })
        .await;

        let health = prober.aggregate_health("svc-a", "tg-1").await.unwrap();
        assert_eq!(health, AggregateHealth::Healthy);
        prober.stop_all().await;
    }

    #[tokio::test]
    async fn probe_writes_preserve_concurrent_role_change() {
        let sim = Arc::new(SimPlatform::new());
        let state = StateStore::open_in_memory().unwrap();
        let group = seeded_group(&sim, &state, "svc-a", "tg-1", 2).await;

        let transport = Arc::new(PlatformProbeTransport::new(sim.clone()));
        let prober = HealthProber::new(state.clone(), transport, fast_config());
        prober.start_probing(&group).await;

        // Promote the group out from under the running probe loop.
        let mut promoted = state.get_group("svc-a", "tg-1").unwrap().unwrap();
        promoted.role = GroupRole::Active;
        state.put_group(&promoted).unwrap();

        let check_state = state.clone();
        wait_for(|| {
            check_state
                .get_group("svc-a", "tg-1")
                .unwrap()
                .unwrap()
                .targets
                .iter()
                .all(|t| t.health == TargetHealth::Healthy)
        })
        .await;

        // Health landed without reverting the role.
        let loaded = state.get_group("svc-a", "tg-1").unwrap().unwrap();
        assert_eq!(loaded.role, GroupRole::Active);
        prober.stop_all().await;
    }

    #[tokio::test]
    async fn failing_group_goes_unhealthy() {
        let sim = Arc::new(SimPlatform::with_behavior(SimBehavior {
            never_healthy: true,
            ..Default::default()
        }));
        let state = StateStore::open_in_memory().unwrap();
        let group = seeded_group(&sim, &state, "svc-a", "tg-1", 2).await;

        let transport = Arc::new(PlatformProbeTransport::new(sim.clone()));
        let prober = HealthProber::new(state.clone(), transport, fast_config());
        prober.start_probing(&group).await;

        let check_state = state.clone();
        wait_for(|| {
            check_state
                .get_group("svc-a", "tg-1")
                .unwrap()
                .unwrap()
                .targets
                .iter()
                .all(|t| t.health == TargetHealth::Unhealthy)
        })
        .await;

        let health = prober.aggregate_health("svc-a", "tg-1").await.unwrap();
        assert_eq!(health, AggregateHealth::Unhealthy);
        prober.stop_all().await;
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let sim = Arc::new(SimPlatform::new());
        let state = StateStore::open_in_memory().unwrap();
        let group = seeded_group(&sim, &state, "svc-a", "tg-1", 1).await;

        let transport = Arc::new(PlatformProbeTransport::new(sim.clone()));
        let prober = HealthProber::new(state.clone(), transport, fast_config());

        prober.start_probing(&group).await;
        prober.start_probing(&group).await;
        assert!(prober.is_probing("tg-1").await);

        prober.stop_probing("tg-1").await;
        assert!(!prober.is_probing("tg-1").await);
        // Stopping again is harmless.
        prober.stop_probing("tg-1").await;
    }

    #[tokio::test]
    async fn probe_loop_exits_when_group_destroyed() {
        let sim = Arc::new(SimPlatform::new());
        let state = StateStore::open_in_memory().unwrap();
        let group = seeded_group(&sim, &state, "svc-a", "tg-1", 1).await;

        let transport = Arc::new(PlatformProbeTransport::new(sim.clone()));
        let prober = HealthProber::new(state.clone(), transport, fast_config());
        prober.start_probing(&group).await;

        state.delete_group("svc-a", "tg-1").unwrap();
        // The loop notices on its next tick; aggregate of a missing
        // group is unhealthy.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let health = prober.aggregate_health("svc-a", "tg-1").await.unwrap();
        assert_eq!(health, AggregateHealth::Unhealthy);
        prober.stop_all().await;
    }

    #[tokio::test]
    async fn unprobed_group_gets_no_grace() {
        let state = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(SimPlatform::new());
        let group = seeded_group(&sim, &state, "svc-a", "tg-1", 2).await;
        drop(group);

        let transport = Arc::new(PlatformProbeTransport::new(sim));
        let prober = HealthProber::new(state, transport, fast_config());

        // All targets Unknown, nobody probing: unhealthy.
        let health = prober.aggregate_health("svc-a", "tg-1").await.unwrap();
        assert_eq!(health, AggregateHealth::Unhealthy);
    }
}
