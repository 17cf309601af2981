//! StateStore — redb-backed persistence for Switchyard.
//!
//! Provides typed CRUD operations over rollouts and target groups, plus
//! the append-only deployment ledger. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk
//! and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use switchyard_core::{LedgerEntry, Rollout, TargetGroup, TargetHealth, group_key};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(LEDGER).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Insert or update a rollout record.
    pub fn put_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        let value = serde_json::to_vec(rollout).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table
                .insert(rollout.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout_id = %rollout.id, state = %rollout.state, "rollout stored");
        Ok(())
    }

    /// Get a rollout by id.
    pub fn get_rollout(&self, rollout_id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(rollout_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let rollout: Rollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rollout))
            }
            None => Ok(None),
        }
    }

    /// Atomically set the cancel flag on a rollout record.
    ///
    /// Read-modify-write inside a single write transaction, so a racing
    /// control-loop transition is never overwritten with a stale state.
    /// Returns the updated record, or `None` if the rollout is unknown.
    pub fn request_cancel(&self, rollout_id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = match table.get(rollout_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Ok(None),
            };
            rollout.cancel_requested = true;
            let value = serde_json::to_vec(&rollout).map_err(map_err!(Serialize))?;
            table
                .insert(rollout_id, value.as_slice())
                .map_err(map_err!(Write))?;
            updated = rollout;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%rollout_id, "cancel flag set");
        Ok(Some(updated))
    }

    /// List all rollouts for a deployable unit.
    pub fn list_rollouts_for_unit(&self, unit_id: &str) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if rollout.unit_id == unit_id {
                results.push(rollout);
            }
        }
        Ok(results)
    }

    /// Find the in-flight (non-terminal) rollout for a unit, if any.
    ///
    /// The single-flight invariant guarantees at most one exists.
    pub fn find_in_flight_rollout(&self, unit_id: &str) -> StateResult<Option<Rollout>> {
        let rollouts = self.list_rollouts_for_unit(unit_id)?;
        Ok(rollouts.into_iter().find(|r| !r.state.is_terminal()))
    }

    /// List every non-terminal rollout across all units (crash recovery).
    pub fn list_in_flight_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !rollout.state.is_terminal() {
                results.push(rollout);
            }
        }
        Ok(results)
    }

    // ── Target groups ──────────────────────────────────────────────

    /// Insert or update a target group record.
    pub fn put_group(&self, group: &TargetGroup) -> StateResult<()> {
        let key = group.table_key();
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Atomically update the health of individual targets in a group.
    ///
    /// Read-modify-write inside a single write transaction, touching
    /// only `targets[*].health`, so a racing role or membership change
    /// on the same group record is never overwritten with a stale copy.
    /// Unknown target ids are ignored. Returns `false` if the group is
    /// unknown.
    pub fn update_target_health(
        &self,
        unit_id: &str,
        group_id: &str,
        updates: &[(String, TargetHealth)],
    ) -> StateResult<bool> {
        let key = group_key(unit_id, group_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let mut group: TargetGroup = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Ok(false),
            };
            for target in &mut group.targets {
                if let Some((_, health)) = updates.iter().find(|(id, _)| *id == target.id) {
                    target.health = *health;
                }
            }
            let value = serde_json::to_vec(&group).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Get a target group by unit and group id.
    pub fn get_group(&self, unit_id: &str, group_id: &str) -> StateResult<Option<TargetGroup>> {
        let key = group_key(unit_id, group_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let group: TargetGroup =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// List all target groups for a unit, oldest first.
    pub fn list_groups_for_unit(&self, unit_id: &str) -> StateResult<Vec<TargetGroup>> {
        let prefix = format!("{unit_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let group: TargetGroup =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(group);
            }
        }
        results.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(results)
    }

    /// Delete a target group record. Returns true if it existed.
    pub fn delete_group(&self, unit_id: &str, group_id: &str) -> StateResult<bool> {
        let key = group_key(unit_id, group_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "target group deleted");
        Ok(existed)
    }

    // ── Ledger ─────────────────────────────────────────────────────

    /// Append a ledger entry.
    ///
    /// Append-only: writing over an existing `{unit_id}:{seq}` key is
    /// refused with `AppendConflict`. Callers must treat any error here
    /// as fail-closed and halt further transitions.
    pub fn append_ledger(&self, entry: &LedgerEntry) -> StateResult<()> {
        let key = entry.table_key();
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LEDGER).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AppendConflict(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, to = %entry.to, "ledger entry appended");
        Ok(())
    }

    /// Next free sequence number for a unit's ledger.
    pub fn next_ledger_seq(&self, unit_id: &str) -> StateResult<u64> {
        Ok(match self.last_ledger_entry(unit_id)? {
            Some(entry) => entry.seq + 1,
            None => 1,
        })
    }

    /// The most recent ledger entry for a unit, if any.
    pub fn last_ledger_entry(&self, unit_id: &str) -> StateResult<Option<LedgerEntry>> {
        Ok(self.ledger_entries(unit_id)?.into_iter().next_back())
    }

    /// All ledger entries for a unit in sequence (time) order.
    pub fn ledger_entries(&self, unit_id: &str) -> StateResult<Vec<LedgerEntry>> {
        let prefix = format!("{unit_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEDGER).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        // Keys are zero-padded, so table iteration order is seq order.
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let entry: LedgerEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(entry);
            }
        }
        Ok(results)
    }

    /// All ledger entries for a single rollout, in sequence order.
    pub fn ledger_entries_for_rollout(
        &self,
        unit_id: &str,
        rollout_id: &str,
    ) -> StateResult<Vec<LedgerEntry>> {
        Ok(self
            .ledger_entries(unit_id)?
            .into_iter()
            .filter(|e| e.rollout_id == rollout_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{
        FailureReason, GroupRole, RolloutState, Target, TargetHealth, now_millis,
    };

    fn test_group(unit_id: &str, group_id: &str, created_at: u64) -> TargetGroup {
        TargetGroup {
            id: group_id.to_string(),
            unit_id: unit_id.to_string(),
            artifact_ref: "v1".to_string(),
            role: GroupRole::Candidate,
            targets: vec![Target {
                id: format!("{group_id}-t0"),
                group_id: group_id.to_string(),
                address: "127.0.0.1:8080".to_string(),
                health: TargetHealth::Unknown,
                weight: 0.0,
            }],
            created_at,
        }
    }

    fn test_entry(unit_id: &str, seq: u64, to: RolloutState) -> LedgerEntry {
        LedgerEntry {
            rollout_id: "ro-1".to_string(),
            unit_id: unit_id.to_string(),
            seq,
            from: None,
            to,
            timestamp: now_millis(),
            detail: String::new(),
        }
    }

    #[test]
    fn rollout_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rollout = Rollout::new("ro-1".into(), "svc-a".into(), "v2".into(), 2);
        store.put_rollout(&rollout).unwrap();

        let loaded = store.get_rollout("ro-1").unwrap().unwrap();
        assert_eq!(loaded, rollout);

        rollout.state = RolloutState::RolledBack;
        rollout.failure_reason = Some(FailureReason::HealthTimeout);
        store.put_rollout(&rollout).unwrap();

        let loaded = store.get_rollout("ro-1").unwrap().unwrap();
        assert_eq!(loaded.state, RolloutState::RolledBack);
        assert_eq!(loaded.failure_reason, Some(FailureReason::HealthTimeout));
    }

    #[test]
    fn request_cancel_sets_flag_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.request_cancel("ro-missing").unwrap(), None);

        let mut rollout = Rollout::new("ro-1".into(), "svc-a".into(), "v2".into(), 2);
        rollout.state = RolloutState::HealthChecking;
        store.put_rollout(&rollout).unwrap();

        let updated = store.request_cancel("ro-1").unwrap().unwrap();
        assert!(updated.cancel_requested);
        // Only the flag changes; the rest of the record is untouched.
        assert_eq!(updated.state, RolloutState::HealthChecking);
        let loaded = store.get_rollout("ro-1").unwrap().unwrap();
        assert!(loaded.cancel_requested);
    }

    #[test]
    fn target_health_update_does_not_clobber_role_change() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_group(&test_group("svc-a", "tg-1", 1)).unwrap();

        // Promotion lands after the stale reader loaded its copy.
        let mut promoted = store.get_group("svc-a", "tg-1").unwrap().unwrap();
        promoted.role = GroupRole::Active;
        store.put_group(&promoted).unwrap();

        let updated = store
            .update_target_health(
                "svc-a",
                "tg-1",
                &[("tg-1-t0".to_string(), TargetHealth::Healthy)],
            )
            .unwrap();
        assert!(updated);

        let loaded = store.get_group("svc-a", "tg-1").unwrap().unwrap();
        assert_eq!(loaded.role, GroupRole::Active);
        assert_eq!(loaded.targets[0].health, TargetHealth::Healthy);

        // Unknown target ids are ignored, unknown groups reported.
        store
            .update_target_health("svc-a", "tg-1", &[("ghost".to_string(), TargetHealth::Unhealthy)])
            .unwrap();
        let loaded = store.get_group("svc-a", "tg-1").unwrap().unwrap();
        assert_eq!(loaded.targets[0].health, TargetHealth::Healthy);
        assert!(!store
            .update_target_health("svc-a", "tg-missing", &[])
            .unwrap());
    }

    #[test]
    fn get_missing_rollout_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_rollout("nope").unwrap().is_none());
    }

    #[test]
    fn find_in_flight_skips_terminal() {
        let store = StateStore::open_in_memory().unwrap();
        let mut done = Rollout::new("ro-1".into(), "svc-a".into(), "v1".into(), 2);
        done.state = RolloutState::Complete;
        store.put_rollout(&done).unwrap();

        assert!(store.find_in_flight_rollout("svc-a").unwrap().is_none());

        let mut live = Rollout::new("ro-2".into(), "svc-a".into(), "v2".into(), 2);
        live.state = RolloutState::Shifting;
        store.put_rollout(&live).unwrap();

        let found = store.find_in_flight_rollout("svc-a").unwrap().unwrap();
        assert_eq!(found.id, "ro-2");
    }

    #[test]
    fn in_flight_scoped_to_unit() {
        let store = StateStore::open_in_memory().unwrap();
        let mut other = Rollout::new("ro-1".into(), "svc-b".into(), "v2".into(), 2);
        other.state = RolloutState::HealthChecking;
        store.put_rollout(&other).unwrap();

        assert!(store.find_in_flight_rollout("svc-a").unwrap().is_none());
        assert_eq!(store.list_in_flight_rollouts().unwrap().len(), 1);
    }

    #[test]
    fn groups_listed_oldest_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_group(&test_group("svc-a", "tg-2", 2000)).unwrap();
        store.put_group(&test_group("svc-a", "tg-1", 1000)).unwrap();
        store.put_group(&test_group("svc-b", "tg-3", 500)).unwrap();

        let groups = store.list_groups_for_unit("svc-a").unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, "tg-1");
        assert_eq!(groups[1].id, "tg-2");
    }

    #[test]
    fn delete_group_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_group(&test_group("svc-a", "tg-1", 1000)).unwrap();

        assert!(store.delete_group("svc-a", "tg-1").unwrap());
        assert!(!store.delete_group("svc-a", "tg-1").unwrap());
        assert!(store.get_group("svc-a", "tg-1").unwrap().is_none());
    }

    #[test]
    fn ledger_appends_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_ledger_seq("svc-a").unwrap(), 1);

        store
            .append_ledger(&test_entry("svc-a", 1, RolloutState::Requested))
            .unwrap();
        store
            .append_ledger(&test_entry("svc-a", 2, RolloutState::Provisioning))
            .unwrap();

        assert_eq!(store.next_ledger_seq("svc-a").unwrap(), 3);
        let last = store.last_ledger_entry("svc-a").unwrap().unwrap();
        assert_eq!(last.seq, 2);
        assert_eq!(last.to, RolloutState::Provisioning);

        let entries = store.ledger_entries("svc-a").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn ledger_refuses_overwrite() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_ledger(&test_entry("svc-a", 1, RolloutState::Requested))
            .unwrap();

        let err = store
            .append_ledger(&test_entry("svc-a", 1, RolloutState::Provisioning))
            .unwrap_err();
        assert!(matches!(err, StateError::AppendConflict(_)));

        // The original entry is untouched.
        let entries = store.ledger_entries("svc-a").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to, RolloutState::Requested);
    }

    #[test]
    fn ledger_scoped_by_unit() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_ledger(&test_entry("svc-a", 1, RolloutState::Requested))
            .unwrap();
        store
            .append_ledger(&test_entry("svc-b", 1, RolloutState::Requested))
            .unwrap();

        assert_eq!(store.ledger_entries("svc-a").unwrap().len(), 1);
        assert_eq!(store.ledger_entries("svc-b").unwrap().len(), 1);
        assert!(store.ledger_entries("svc").unwrap().is_empty());
    }

    #[test]
    fn ledger_filters_by_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        let mut entry = test_entry("svc-a", 1, RolloutState::Requested);
        store.append_ledger(&entry).unwrap();
        entry.seq = 2;
        entry.rollout_id = "ro-2".to_string();
        store.append_ledger(&entry).unwrap();

        let entries = store.ledger_entries_for_rollout("svc-a", "ro-2").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 2);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&path).unwrap();
            let rollout = Rollout::new("ro-1".into(), "svc-a".into(), "v2".into(), 2);
            store.put_rollout(&rollout).unwrap();
            store
                .append_ledger(&test_entry("svc-a", 1, RolloutState::Requested))
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_rollout("ro-1").unwrap().is_some());
        assert_eq!(store.ledger_entries("svc-a").unwrap().len(), 1);
    }
}
