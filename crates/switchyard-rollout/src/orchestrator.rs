//! Rollout orchestrator — owns the control loop for every in-flight
//! rollout and drives the blue/green state machine.
//!
//! One spawned task per in-flight rollout; the per-unit slot in the
//! `slots` map is the single-flight lock. Every state transition is
//! appended to the deployment ledger before the stored rollout record
//! advances; a failed append halts the rollout (fail-closed).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use switchyard_core::{
    FailureReason, GroupRole, LedgerEntry, Rollout, RolloutConfig, RolloutId, RolloutState,
    UnitId, now_millis,
};
use switchyard_health::{AggregateHealth, HealthProber, PlatformProbeTransport};
use switchyard_platform::{ComputePlatform, RoutingApi};
use switchyard_registry::{RegistryError, TargetRegistry};
use switchyard_state::StateStore;
use switchyard_traffic::{RampPlan, TrafficShifter};

use crate::error::{RolloutError, RolloutResult};

/// Per-rollout control loop bookkeeping. Presence of a unit's slot in
/// the map means a rollout is in flight for that unit.
struct RolloutSlot {
    rollout_id: RolloutId,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The rollout orchestrator. Cheap to clone; all clones share the same
/// control loops and collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    state: StateStore,
    registry: TargetRegistry,
    prober: HealthProber,
    shifter: TrafficShifter,
    config: RolloutConfig,
    ramp: RampPlan,
    slots: RwLock<HashMap<UnitId, RolloutSlot>>,
    /// Disambiguates rollout ids created within the same millisecond.
    nonce: AtomicU64,
}

impl Orchestrator {
    /// Build an orchestrator over the given platform and routing
    /// control planes.
    pub fn new(
        state: StateStore,
        platform: Arc<dyn ComputePlatform>,
        routing: Arc<dyn RoutingApi>,
        config: RolloutConfig,
    ) -> RolloutResult<Self> {
        config
            .validate()
            .map_err(|e| RolloutError::Config(e.to_string()))?;
        let ramp = RampPlan::new(config.ramp_steps.clone()).map_err(RolloutError::Config)?;

        let registry = TargetRegistry::new(platform.clone(), state.clone(), config.provision.clone());
        let transport = Arc::new(PlatformProbeTransport::new(platform));
        let prober = HealthProber::new(state.clone(), transport, config.probe.clone());
        let shifter = TrafficShifter::new(routing, config.shift.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                state,
                registry,
                prober,
                shifter,
                config,
                ramp,
                slots: RwLock::new(HashMap::new()),
                nonce: AtomicU64::new(0),
            }),
        })
    }

    /// Start a rollout of `artifact_ref` for a unit.
    ///
    /// Rejected synchronously with `Conflict` (no state mutation) if a
    /// rollout is already in flight for the unit, whether owned by this
    /// process or found in the store.
    pub async fn start(
        &self,
        unit_id: &str,
        artifact_ref: &str,
        group_size: u32,
    ) -> RolloutResult<RolloutId> {
        let inner = &self.inner;
        let mut slots = inner.slots.write().await;
        if slots.contains_key(unit_id) {
            return Err(RolloutError::Conflict(unit_id.to_string()));
        }
        if inner.state.find_in_flight_rollout(unit_id)?.is_some() {
            return Err(RolloutError::Conflict(unit_id.to_string()));
        }

        let rollout_id = inner.next_rollout_id(unit_id);
        let mut rollout = Rollout::new(
            rollout_id.clone(),
            unit_id.to_string(),
            artifact_ref.to_string(),
            group_size,
        );
        rollout.active_group_id = inner.registry.active_group(unit_id)?.map(|g| g.id);

        // Audit creation before the record goes live.
        inner.append_entry(
            &rollout,
            None,
            RolloutState::Requested,
            format!("rollout requested for artifact {artifact_ref}"),
        )?;
        inner.state.put_rollout(&rollout)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = inner.clone().spawn_drive(rollout_id.clone(), cancel_rx);
        slots.insert(
            unit_id.to_string(),
            RolloutSlot {
                rollout_id: rollout_id.clone(),
                cancel_tx,
                handle,
            },
        );

        info!(%rollout_id, %unit_id, %artifact_ref, group_size, "rollout started");
        Ok(rollout_id)
    }

    /// Request cancellation of an in-flight rollout.
    ///
    /// Honored from `HealthChecking` and `Shifting` as a forced entry
    /// into the matching rollback path. During `Requested`/`Provisioning`
    /// the request queues until candidate resources exist and can be
    /// torn down cleanly. Any other state is rejected with
    /// `InvalidState`.
    pub async fn cancel(&self, rollout_id: &str) -> RolloutResult<()> {
        let inner = &self.inner;
        let rollout = inner
            .state
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))?;

        match rollout.state {
            RolloutState::Requested
            | RolloutState::Provisioning
            | RolloutState::HealthChecking
            | RolloutState::Shifting => {}
            state => {
                return Err(RolloutError::InvalidState {
                    id: rollout.id,
                    state,
                });
            }
        }

        inner.state.request_cancel(rollout_id)?;

        // Wake the owning control loop if it lives in this process;
        // other processes observe the stored flag at their next poll.
        let slots = inner.slots.read().await;
        if let Some(slot) = slots.values().find(|s| s.rollout_id == rollout_id) {
            let _ = slot.cancel_tx.send(true);
        }
        info!(%rollout_id, "cancellation requested");
        Ok(())
    }

    /// Current record of a rollout.
    pub fn status(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        self.inner
            .state
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))
    }

    /// Full deployment ledger for a unit, oldest first.
    pub fn history(&self, unit_id: &str) -> RolloutResult<Vec<LedgerEntry>> {
        Ok(self.inner.state.ledger_entries(unit_id)?)
    }

    /// Resume every non-terminal rollout found in the store.
    ///
    /// Crash recovery: each resumed control loop re-enters its last
    /// recorded state; the individual steps are idempotent, so a
    /// half-finished step is redone rather than duplicated (an already
    /// provisioned candidate group is reused, not re-provisioned).
    pub async fn resume(&self) -> RolloutResult<Vec<RolloutId>> {
        let inner = &self.inner;
        let mut slots = inner.slots.write().await;
        let mut resumed = Vec::new();
        for mut rollout in inner.state.list_in_flight_rollouts()? {
            if slots.contains_key(&rollout.unit_id) {
                continue;
            }
            rollout.attempts += 1;
            inner.state.put_rollout(&rollout)?;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let handle = inner.clone().spawn_drive(rollout.id.clone(), cancel_rx);
            info!(
                rollout_id = %rollout.id,
                unit_id = %rollout.unit_id,
                state = %rollout.state,
                attempt = rollout.attempts,
                "resuming in-flight rollout"
            );
            slots.insert(
                rollout.unit_id.clone(),
                RolloutSlot {
                    rollout_id: rollout.id.clone(),
                    cancel_tx,
                    handle,
                },
            );
            resumed.push(rollout.id);
        }
        Ok(resumed)
    }

    /// Poll until the rollout reaches a terminal state.
    pub async fn wait_terminal(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        loop {
            let rollout = self.status(rollout_id)?;
            if rollout.state.is_terminal() {
                return Ok(rollout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Abort all control loops and probe tasks.
    pub async fn shutdown(&self) {
        let mut slots = self.inner.slots.write().await;
        for (unit_id, slot) in slots.drain() {
            slot.handle.abort();
            debug!(%unit_id, rollout_id = %slot.rollout_id, "control loop aborted");
        }
        drop(slots);
        self.inner.prober.stop_all().await;
    }
}

impl Inner {
    fn next_rollout_id(&self, unit_id: &str) -> RolloutId {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        format!("ro-{unit_id}-{}-{nonce}", now_millis())
    }

    fn spawn_drive(
        self: Arc<Self>,
        rollout_id: RolloutId,
        cancel_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.drive(&rollout_id, cancel_rx).await {
                // The rollout record keeps its last audited state; a
                // later resume re-enters it.
                error!(%rollout_id, %e, "control loop halted");
            }
            self.release_slot(&rollout_id).await;
        })
    }

    async fn release_slot(&self, rollout_id: &str) {
        let mut slots = self.slots.write().await;
        slots.retain(|_, slot| slot.rollout_id != rollout_id);
    }

    /// The control loop: load the rollout, execute the step for its
    /// current state, repeat until terminal.
    async fn drive(
        &self,
        rollout_id: &str,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> RolloutResult<()> {
        loop {
            let mut rollout = self
                .state
                .get_rollout(rollout_id)?
                .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))?;

            match rollout.state {
                RolloutState::Requested => {
                    self.transition(
                        &mut rollout,
                        RolloutState::Provisioning,
                        None,
                        "provisioning candidate group",
                    )?;
                }
                RolloutState::Provisioning => self.step_provision(&mut rollout).await?,
                RolloutState::HealthChecking => {
                    self.step_health_check(&mut rollout, &mut cancel_rx).await?
                }
                RolloutState::Shifting => self.step_shift(&mut rollout, &mut cancel_rx).await?,
                RolloutState::Draining => self.step_drain(&mut rollout).await?,
                RolloutState::UnhealthyRollback | RolloutState::ShiftFailedRollback => {
                    self.step_rollback(&mut rollout).await?
                }
                RolloutState::ProvisionFailed
                | RolloutState::Complete
                | RolloutState::RolledBack => {
                    info!(
                        rollout_id = %rollout.id,
                        state = %rollout.state,
                        failure_reason = ?rollout.failure_reason,
                        "rollout reached terminal state"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Provision the candidate group.
    ///
    /// Idempotent across crashes: a candidate group that already exists
    /// (recorded on the rollout, or persisted before the crash without
    /// the rollout record catching up) is reused.
    async fn step_provision(&self, rollout: &mut Rollout) -> RolloutResult<()> {
        if let Some(existing) = self.existing_candidate(rollout)? {
            rollout.candidate_group_id = Some(existing.clone());
            return self.transition(
                rollout,
                RolloutState::HealthChecking,
                None,
                format!("candidate group {existing} already provisioned"),
            );
        }

        match self
            .registry
            .create_group(&rollout.unit_id, &rollout.artifact_ref, rollout.group_size)
            .await
        {
            Ok(group) => {
                rollout.candidate_group_id = Some(group.id.clone());
                self.transition(
                    rollout,
                    RolloutState::HealthChecking,
                    None,
                    format!(
                        "candidate group {} provisioned with {} targets",
                        group.id,
                        group.targets.len()
                    ),
                )
            }
            Err(RegistryError::Provision(msg)) => self.transition(
                rollout,
                RolloutState::ProvisionFailed,
                Some(FailureReason::ProvisionRejected),
                msg,
            ),
            Err(e) => Err(e.into()),
        }
    }

    fn existing_candidate(&self, rollout: &Rollout) -> RolloutResult<Option<String>> {
        if let Some(group_id) = &rollout.candidate_group_id {
            if self.state.get_group(&rollout.unit_id, group_id)?.is_some() {
                return Ok(Some(group_id.clone()));
            }
        }
        let orphan = self
            .registry
            .list_groups(&rollout.unit_id)?
            .into_iter()
            .find(|g| g.role == GroupRole::Candidate && g.artifact_ref == rollout.artifact_ref);
        Ok(orphan.map(|g| g.id))
    }

    /// Poll candidate aggregate health until it converges, degrades, or
    /// the budget runs out. Re-polls are not ledgered; only the exit
    /// transition is.
    async fn step_health_check(
        &self,
        rollout: &mut Rollout,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> RolloutResult<()> {
        let candidate = self.candidate_id(rollout)?;
        self.ensure_probing(rollout, &candidate).await?;

        let deadline = Instant::now() + self.config.health_check_timeout;
        loop {
            if self.cancel_observed(rollout, cancel_rx)? {
                return self.transition(
                    rollout,
                    RolloutState::UnhealthyRollback,
                    Some(FailureReason::Cancelled),
                    "cancelled during health checking",
                );
            }

            match self.prober.aggregate_health(&rollout.unit_id, &candidate).await? {
                AggregateHealth::Healthy => {
                    return self.transition(
                        rollout,
                        RolloutState::Shifting,
                        None,
                        format!("candidate group {candidate} converged healthy"),
                    );
                }
                AggregateHealth::Unhealthy => {
                    return self.transition(
                        rollout,
                        RolloutState::UnhealthyRollback,
                        Some(FailureReason::CandidateUnhealthy),
                        format!("candidate group {candidate} reported unhealthy"),
                    );
                }
                AggregateHealth::Degraded => {}
            }

            if Instant::now() >= deadline {
                return self.transition(
                    rollout,
                    RolloutState::UnhealthyRollback,
                    Some(FailureReason::HealthTimeout),
                    format!(
                        "candidate group {candidate} not healthy within {:?}",
                        self.config.health_check_timeout
                    ),
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.probe.interval) => {}
                _ = cancel_rx.changed() => {}
            }
        }
    }

    /// Walk the ramp plan upward, one confirmed and ledgered step at a
    /// time, with a health gate before each step and a bake window
    /// after it. A single unhealthy reading rolls back immediately.
    async fn step_shift(
        &self,
        rollout: &mut Rollout,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> RolloutResult<()> {
        let candidate = self.candidate_id(rollout)?;
        let active = rollout.active_group_id.clone();
        self.ensure_probing(rollout, &candidate).await?;

        loop {
            if self.cancel_observed(rollout, cancel_rx)? {
                return self.transition(
                    rollout,
                    RolloutState::ShiftFailedRollback,
                    Some(FailureReason::Cancelled),
                    "cancelled during traffic shift",
                );
            }

            if self.prober.aggregate_health(&rollout.unit_id, &candidate).await?
                == AggregateHealth::Unhealthy
            {
                return self.transition(
                    rollout,
                    RolloutState::ShiftFailedRollback,
                    Some(FailureReason::CandidateUnhealthy),
                    format!(
                        "candidate group {candidate} unhealthy at {:.0}% traffic",
                        rollout.traffic_split * 100.0
                    ),
                );
            }

            let Some(next) = self.ramp.next_step(rollout.traffic_split) else {
                return self.transition(
                    rollout,
                    RolloutState::Draining,
                    None,
                    "ramp complete, draining previous active group",
                );
            };

            let applied = match self
                .shifter
                .set_split(&rollout.unit_id, active.as_deref(), &candidate, next)
                .await
            {
                Ok(()) => {
                    self.shifter
                        .confirm_split(&rollout.unit_id, &candidate, next)
                        .await
                }
                Err(e) => Err(e),
            };

            match applied {
                Ok(()) => {
                    rollout.traffic_split = next;
                    self.transition(
                        rollout,
                        RolloutState::Shifting,
                        None,
                        format!("split {:.0}% confirmed", next * 100.0),
                    )?;
                }
                Err(e) => {
                    return self.transition(
                        rollout,
                        RolloutState::ShiftFailedRollback,
                        Some(FailureReason::RoutingRejected),
                        e.to_string(),
                    );
                }
            }

            // Bake: watch the candidate under its new share before the
            // next step. The final step has nothing left to gate.
            if !RampPlan::complete(rollout.traffic_split) {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.shift.step_bake) => {}
                    _ = cancel_rx.changed() => {}
                }
            }
        }
    }

    /// Tear down the previous active group and promote the candidate.
    ///
    /// Cancellation is past its point of no return here: the candidate
    /// owns all traffic and the only way out is forward.
    async fn step_drain(&self, rollout: &mut Rollout) -> RolloutResult<()> {
        let candidate = self.candidate_id(rollout)?;

        if let Some(old) = rollout.active_group_id.clone() {
            self.prober.stop_probing(&old).await;
            match self.registry.mark_draining(&rollout.unit_id, &old) {
                // Already destroyed by a previous attempt.
                Ok(()) | Err(RegistryError::GroupNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.registry.destroy_group(&rollout.unit_id, &old).await?;
        }

        // Stop probing before the role flip so no probe tick holds a
        // pre-promotion copy of the group record.
        self.prober.stop_probing(&candidate).await;
        self.registry
            .set_role(&rollout.unit_id, &candidate, GroupRole::Active)?;

        // Drop the destroyed group from the routing table.
        if let Err(e) = self
            .shifter
            .set_split(&rollout.unit_id, None, &candidate, 1.0)
            .await
        {
            warn!(rollout_id = %rollout.id, %e, "routing table cleanup failed");
        }

        self.transition(
            rollout,
            RolloutState::Complete,
            None,
            format!("candidate group {candidate} promoted to active"),
        )
    }

    /// Common rollback tail for both rollback states: force the split
    /// to zero in one step (never ramped down), then tear the candidate
    /// down.
    async fn step_rollback(&self, rollout: &mut Rollout) -> RolloutResult<()> {
        let active = rollout.active_group_id.clone();

        if let Some(candidate) = rollout.candidate_group_id.clone() {
            match self
                .shifter
                .reset(&rollout.unit_id, active.as_deref(), &candidate)
                .await
            {
                Ok(()) => rollout.traffic_split = 0.0,
                // Teardown still removes the candidate from service;
                // leave the recorded split for the operator to see.
                Err(e) => warn!(rollout_id = %rollout.id, %e, "traffic reset failed during rollback"),
            }
            self.prober.stop_probing(&candidate).await;
            self.registry
                .destroy_group(&rollout.unit_id, &candidate)
                .await?;
        }

        self.transition(
            rollout,
            RolloutState::RolledBack,
            None,
            "candidate destroyed, traffic restored to previous group",
        )
    }

    /// Append the ledger entry and advance the stored rollout record.
    ///
    /// The append happens first; if it fails the rollout record is left
    /// untouched and the error propagates (fail-closed).
    fn transition(
        &self,
        rollout: &mut Rollout,
        to: RolloutState,
        reason: Option<FailureReason>,
        detail: impl Into<String>,
    ) -> RolloutResult<()> {
        let from = rollout.state;
        if !from.can_transition_to(to) {
            return Err(RolloutError::InvalidState {
                id: rollout.id.clone(),
                state: from,
            });
        }

        self.append_entry(rollout, Some(from), to, detail.into())?;

        rollout.state = to;
        rollout.last_transition_at = now_millis();
        if reason.is_some() {
            rollout.failure_reason = reason;
        }
        self.state.put_rollout(rollout)?;
        info!(rollout_id = %rollout.id, %from, %to, "state transition");
        Ok(())
    }

    fn append_entry(
        &self,
        rollout: &Rollout,
        from: Option<RolloutState>,
        to: RolloutState,
        detail: String,
    ) -> RolloutResult<()> {
        let seq = self.state.next_ledger_seq(&rollout.unit_id)?;
        let entry = LedgerEntry {
            rollout_id: rollout.id.clone(),
            unit_id: rollout.unit_id.clone(),
            seq,
            from,
            to,
            timestamp: now_millis(),
            detail,
        };
        self.state.append_ledger(&entry)?;
        Ok(())
    }

    fn candidate_id(&self, rollout: &Rollout) -> RolloutResult<String> {
        rollout
            .candidate_group_id
            .clone()
            .ok_or_else(|| RolloutError::InvalidState {
                id: rollout.id.clone(),
                state: rollout.state,
            })
    }

    /// Subscribe the prober to the candidate group. Idempotent, so safe
    /// to call on every (re-)entry into a probed state.
    async fn ensure_probing(&self, rollout: &Rollout, group_id: &str) -> RolloutResult<()> {
        if let Some(group) = self.state.get_group(&rollout.unit_id, group_id)? {
            self.prober.start_probing(&group).await;
        }
        Ok(())
    }

    /// Whether cancellation has been requested, via the local watch
    /// channel or the flag another process persisted on the record.
    fn cancel_observed(
        &self,
        rollout: &mut Rollout,
        cancel_rx: &watch::Receiver<bool>,
    ) -> RolloutResult<bool> {
        if *cancel_rx.borrow() {
            rollout.cancel_requested = true;
        }
        if let Some(stored) = self.state.get_rollout(&rollout.id)? {
            if stored.cancel_requested {
                rollout.cancel_requested = true;
            }
        }
        Ok(rollout.cancel_requested)
    }
}
