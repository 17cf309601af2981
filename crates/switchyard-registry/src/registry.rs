//! Target registry — creates, enumerates, and tears down target groups.
//!
//! The registry is the only component that talks to the compute
//! platform's provision/terminate surface. Transient platform errors
//! are retried with backoff here; exhaustion surfaces as one
//! `RegistryError::Provision` the state machine turns into a terminal
//! transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use switchyard_core::{
    GroupRole, ProvisionConfig, Target, TargetGroup, TargetHealth, now_millis,
};
use switchyard_platform::{ComputePlatform, PlatformError, ProvisionSpec};
use switchyard_state::StateStore;

use crate::error::{RegistryError, RegistryResult};

/// Manages target group lifecycle against the compute platform.
pub struct TargetRegistry {
    platform: Arc<dyn ComputePlatform>,
    state: StateStore,
    config: ProvisionConfig,
    /// Disambiguates group ids created within the same millisecond.
    nonce: AtomicU64,
}

impl TargetRegistry {
    pub fn new(
        platform: Arc<dyn ComputePlatform>,
        state: StateStore,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            platform,
            state,
            config,
            nonce: AtomicU64::new(0),
        }
    }

    /// Provision a new candidate group of `size` targets running
    /// `artifact_ref`.
    ///
    /// Targets start with `Unknown` health; convergence is the
    /// prober's job. Transient platform errors are retried up to the
    /// configured limit with doubling backoff.
    pub async fn create_group(
        &self,
        unit_id: &str,
        artifact_ref: &str,
        size: u32,
    ) -> RegistryResult<TargetGroup> {
        let group_id = self.next_group_id(unit_id);
        let spec = ProvisionSpec {
            unit_id: unit_id.to_string(),
            group_id: group_id.clone(),
            artifact_ref: artifact_ref.to_string(),
            size,
        };

        let provisioned = self.provision_with_retry(&spec).await?;

        let group = TargetGroup {
            id: group_id.clone(),
            unit_id: unit_id.to_string(),
            artifact_ref: artifact_ref.to_string(),
            role: GroupRole::Candidate,
            targets: provisioned
                .into_iter()
                .map(|t| Target {
                    id: t.id,
                    group_id: group_id.clone(),
                    address: t.address,
                    health: TargetHealth::Unknown,
                    weight: 0.0,
                })
                .collect(),
            created_at: now_millis(),
        };
        self.state.put_group(&group)?;

        info!(
            %unit_id,
            group_id = %group.id,
            %artifact_ref,
            size,
            "candidate group provisioned"
        );
        Ok(group)
    }

    /// Tear down all targets in a group and delete its record.
    ///
    /// Idempotent: destroying an already-destroyed (or never-created)
    /// group is a no-op, never an error.
    pub async fn destroy_group(&self, unit_id: &str, group_id: &str) -> RegistryResult<()> {
        let Some(group) = self.state.get_group(unit_id, group_id)? else {
            debug!(%unit_id, %group_id, "destroy of absent group is a no-op");
            return Ok(());
        };

        let target_ids: Vec<_> = group.targets.iter().map(|t| t.id.clone()).collect();
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.platform.terminate(&target_ids).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.config.retry_limit => {
                    attempt += 1;
                    warn!(%group_id, %e, attempt, "terminate failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(RegistryError::Provision(e.to_string())),
            }
        }

        self.state.delete_group(unit_id, group_id)?;
        info!(%unit_id, %group_id, targets = target_ids.len(), "target group destroyed");
        Ok(())
    }

    /// All groups for a unit, creation time ascending (oldest first —
    /// the group to drain).
    pub fn list_groups(&self, unit_id: &str) -> RegistryResult<Vec<TargetGroup>> {
        Ok(self.state.list_groups_for_unit(unit_id)?)
    }

    /// The group currently holding the `Active` role, if any.
    pub fn active_group(&self, unit_id: &str) -> RegistryResult<Option<TargetGroup>> {
        Ok(self
            .list_groups(unit_id)?
            .into_iter()
            .find(|g| g.role == GroupRole::Active))
    }

    /// Flip a group's role. Only the owning rollout's control loop may
    /// call this (single-writer invariant on `TargetGroup.role`).
    pub fn set_role(&self, unit_id: &str, group_id: &str, role: GroupRole) -> RegistryResult<()> {
        let mut group = self
            .state
            .get_group(unit_id, group_id)?
            .ok_or_else(|| RegistryError::GroupNotFound(group_id.to_string()))?;
        group.role = role;
        self.state.put_group(&group)?;
        debug!(%unit_id, %group_id, ?role, "group role changed");
        Ok(())
    }

    /// Mark every target in a group as draining before teardown.
    pub fn mark_draining(&self, unit_id: &str, group_id: &str) -> RegistryResult<()> {
        let mut group = self
            .state
            .get_group(unit_id, group_id)?
            .ok_or_else(|| RegistryError::GroupNotFound(group_id.to_string()))?;
        for target in &mut group.targets {
            target.health = TargetHealth::Draining;
        }
        self.state.put_group(&group)?;
        Ok(())
    }

    async fn provision_with_retry(
        &self,
        spec: &ProvisionSpec,
    ) -> RegistryResult<Vec<switchyard_platform::ProvisionedTarget>> {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.platform.provision(spec).await {
                Ok(targets) => return Ok(targets),
                Err(e @ PlatformError::Transient(_)) if attempt < self.config.retry_limit => {
                    attempt += 1;
                    warn!(
                        unit_id = %spec.unit_id,
                        group_id = %spec.group_id,
                        %e,
                        attempt,
                        "provision failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(
                        unit_id = %spec.unit_id,
                        group_id = %spec.group_id,
                        %e,
                        "provisioning rejected"
                    );
                    return Err(RegistryError::Provision(e.to_string()));
                }
            }
        }
    }

    fn next_group_id(&self, unit_id: &str) -> String {
        let n = self.nonce.fetch_add(1, Ordering::Relaxed);
        format!("tg-{unit_id}-{}-{n}", now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchyard_platform::{SimBehavior, SimPlatform};

    fn fast_config() -> ProvisionConfig {
        ProvisionConfig {
            retry_limit: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn registry_with(behavior: SimBehavior) -> (TargetRegistry, Arc<SimPlatform>) {
        let sim = Arc::new(SimPlatform::with_behavior(behavior));
        let state = StateStore::open_in_memory().unwrap();
        let registry = TargetRegistry::new(sim.clone(), state, fast_config());
        (registry, sim)
    }

    #[tokio::test]
    async fn create_group_persists_unknown_targets() {
        let (registry, _) = registry_with(SimBehavior::default());
        let group = registry.create_group("svc-a", "v2", 2).await.unwrap();

        assert_eq!(group.targets.len(), 2);
        assert_eq!(group.role, GroupRole::Candidate);
        assert!(group.targets.iter().all(|t| t.health == TargetHealth::Unknown));

        let listed = registry.list_groups("svc-a").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, group.id);
    }

    #[tokio::test]
    async fn create_group_surfaces_provision_rejection() {
        let (registry, sim) = registry_with(SimBehavior {
            reject_provision: Some("quota exceeded".to_string()),
            ..Default::default()
        });
        let err = registry.create_group("svc-a", "v2", 2).await.unwrap_err();
        assert!(matches!(err, RegistryError::Provision(_)));
        // Rejection is not retried.
        assert_eq!(sim.provision_calls(), 1);
        assert!(registry.list_groups("svc-a").unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_group_retries_transient_failures() {
        let (registry, sim) = registry_with(SimBehavior {
            transient_provision_failures: 2,
            ..Default::default()
        });
        let group = registry.create_group("svc-a", "v2", 1).await.unwrap();
        assert_eq!(group.targets.len(), 1);
        assert_eq!(sim.provision_calls(), 3);
    }

    #[tokio::test]
    async fn create_group_gives_up_after_retry_budget() {
        let (registry, sim) = registry_with(SimBehavior {
            transient_provision_failures: 10,
            ..Default::default()
        });
        let err = registry.create_group("svc-a", "v2", 1).await.unwrap_err();
        assert!(matches!(err, RegistryError::Provision(_)));
        // Initial attempt plus retry_limit retries.
        assert_eq!(sim.provision_calls(), 4);
    }

    #[tokio::test]
    async fn destroy_group_is_idempotent() {
        let (registry, sim) = registry_with(SimBehavior::default());
        let group = registry.create_group("svc-a", "v2", 2).await.unwrap();

        registry.destroy_group("svc-a", &group.id).await.unwrap();
        assert_eq!(sim.live_targets_in_group(&group.id), 0);
        assert!(registry.list_groups("svc-a").unwrap().is_empty());

        // Destroying again (and a group that never existed) is a no-op.
        registry.destroy_group("svc-a", &group.id).await.unwrap();
        registry.destroy_group("svc-a", "tg-never").await.unwrap();
    }

    #[tokio::test]
    async fn groups_listed_oldest_first() {
        let (registry, _) = registry_with(SimBehavior::default());
        let first = registry.create_group("svc-a", "v1", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = registry.create_group("svc-a", "v2", 1).await.unwrap();

        let listed = registry.list_groups("svc-a").unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn role_flip_and_active_lookup() {
        let (registry, _) = registry_with(SimBehavior::default());
        let group = registry.create_group("svc-a", "v2", 1).await.unwrap();
        assert!(registry.active_group("svc-a").unwrap().is_none());

        registry
            .set_role("svc-a", &group.id, GroupRole::Active)
            .unwrap();
        let active = registry.active_group("svc-a").unwrap().unwrap();
        assert_eq!(active.id, group.id);
    }

    #[tokio::test]
    async fn mark_draining_touches_all_targets() {
        let (registry, _) = registry_with(SimBehavior::default());
        let group = registry.create_group("svc-a", "v2", 3).await.unwrap();
        registry.mark_draining("svc-a", &group.id).unwrap();

        let groups = registry.list_groups("svc-a").unwrap();
        assert!(
            groups[0]
                .targets
                .iter()
                .all(|t| t.health == TargetHealth::Draining)
        );
    }

    #[tokio::test]
    async fn set_role_on_missing_group_fails() {
        let (registry, _) = registry_with(SimBehavior::default());
        let err = registry
            .set_role("svc-a", "tg-none", GroupRole::Active)
            .unwrap_err();
        assert!(matches!(err, RegistryError::GroupNotFound(_)));
    }
}
