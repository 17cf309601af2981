//! switchyard-health — health probing for Switchyard target groups.
//!
//! Provides per-target probe tracking with consecutive-probe thresholds,
//! an HTTP probe implementation, and a background prober that keeps
//! target health in the state store current.
//!
//! # Architecture
//!
//! ```text
//! HealthProber
//!   ├── Per-group background task (fixed probe interval)
//!   │   ├── ProbeTracker per target (consecutive pass/fail runs)
//!   │   ├── ProbeTransport (HTTP or platform-backed)
//!   │   └── Target health written back to StateStore
//!   └── aggregate_health() — derived, never stored
//! ```
//!
//! A target converges `Unknown → Healthy` only after N consecutive
//! successful probes and flips `Healthy → Unhealthy` only after M
//! consecutive failures (both default 3), so transient errors do not
//! flap the aggregate. `Unknown` targets are tolerated for a grace
//! period after probing starts, then count against the group.

pub mod http;
pub mod prober;
pub mod tracker;

pub use http::{HttpProbeTransport, http_probe};
pub use prober::{AggregateHealth, HealthProber, PlatformProbeTransport, ProbeTransport, aggregate};
pub use tracker::{ProbeOutcome, ProbeTracker};
