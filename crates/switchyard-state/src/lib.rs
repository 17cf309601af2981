//! switchyard-state — embedded state store for the Switchyard orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for rollout records, target groups, and the append-only
//! deployment ledger.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{unit_id}:{group_id}`, `{unit_id}:{seq:010}`) enable
//! prefix scans for everything belonging to one deployable unit; the
//! zero-padded ledger sequence makes key order equal time order.
//!
//! The ledger table is strictly append-only: overwriting an existing
//! entry is refused, and callers treat write failures as fail-closed.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
