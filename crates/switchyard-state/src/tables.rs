//! redb table definitions for the Switchyard state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{unit_id}:{child}` so a
//! prefix scan retrieves everything belonging to one deployable unit.

use redb::TableDefinition;

/// Rollout records keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Target group records keyed by `{unit_id}:{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("target_groups");

/// Ledger entries keyed by `{unit_id}:{seq:010}`; key order is time order.
pub const LEDGER: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger");
