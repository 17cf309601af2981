//! Per-target probe result tracking.
//!
//! Consecutive-probe thresholds prevent flapping on transient errors: a
//! target becomes `Healthy` only after N consecutive successes and
//! `Unhealthy` only after M consecutive failures.

use tracing::{debug, warn};

use switchyard_core::{ProbeConfig, TargetHealth};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The health endpoint answered positively.
    Pass,
    /// The health endpoint answered negatively (non-2xx).
    Fail,
    /// The probe could not be executed (connection error, timeout).
    Error,
}

/// Tracks consecutive probe results for a single target.
#[derive(Debug)]
pub struct ProbeTracker {
    status: TargetHealth,
    consecutive_successes: u32,
    consecutive_failures: u32,
    /// Successes needed before Unknown/Unhealthy → Healthy.
    healthy_threshold: u32,
    /// Failures needed before Healthy → Unhealthy.
    unhealthy_threshold: u32,
}

impl ProbeTracker {
    pub fn new(config: &ProbeConfig) -> Self {
        Self::with_thresholds(config.healthy_threshold, config.unhealthy_threshold)
    }

    pub fn with_thresholds(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            status: TargetHealth::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            healthy_threshold,
            unhealthy_threshold,
        }
    }

    /// Record a probe outcome and return the (possibly updated) health.
    pub fn record(&mut self, outcome: ProbeOutcome) -> TargetHealth {
        match outcome {
            ProbeOutcome::Pass => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;

                if self.consecutive_successes >= self.healthy_threshold
                    && self.status != TargetHealth::Healthy
                {
                    debug!(
                        successes = self.consecutive_successes,
                        "target converged to healthy"
                    );
                    self.status = TargetHealth::Healthy;
                }
            }
            ProbeOutcome::Fail | ProbeOutcome::Error => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != TargetHealth::Unhealthy
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "target marked unhealthy"
                    );
                    self.status = TargetHealth::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> TargetHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ProbeTracker {
        ProbeTracker::with_thresholds(3, 3)
    }

    #[test]
    fn starts_unknown() {
        assert_eq!(tracker().status(), TargetHealth::Unknown);
    }

    #[test]
    fn needs_consecutive_successes_to_converge() {
        let mut t = tracker();
        assert_eq!(t.record(ProbeOutcome::Pass), TargetHealth::Unknown);
        assert_eq!(t.record(ProbeOutcome::Pass), TargetHealth::Unknown);
        assert_eq!(t.record(ProbeOutcome::Pass), TargetHealth::Healthy);
    }

    #[test]
    fn interleaved_failure_resets_success_run() {
        let mut t = tracker();
        t.record(ProbeOutcome::Pass);
        t.record(ProbeOutcome::Pass);
        t.record(ProbeOutcome::Fail);
        // Run restarts; two more successes are not enough.
        t.record(ProbeOutcome::Pass);
        assert_eq!(t.record(ProbeOutcome::Pass), TargetHealth::Unknown);
        assert_eq!(t.record(ProbeOutcome::Pass), TargetHealth::Healthy);
    }

    #[test]
    fn needs_consecutive_failures_to_flip_unhealthy() {
        let mut t = tracker();
        for _ in 0..3 {
            t.record(ProbeOutcome::Pass);
        }
        t.record(ProbeOutcome::Fail);
        t.record(ProbeOutcome::Fail);
        assert_eq!(t.status(), TargetHealth::Healthy);
        assert_eq!(t.record(ProbeOutcome::Fail), TargetHealth::Unhealthy);
    }

    #[test]
    fn probe_errors_count_as_failures() {
        let mut t = tracker();
        t.record(ProbeOutcome::Error);
        t.record(ProbeOutcome::Error);
        assert_eq!(t.record(ProbeOutcome::Error), TargetHealth::Unhealthy);
        assert_eq!(t.consecutive_failures(), 3);
    }

    #[test]
    fn recovery_needs_full_success_run() {
        let mut t = tracker();
        for _ in 0..3 {
            t.record(ProbeOutcome::Fail);
        }
        assert_eq!(t.status(), TargetHealth::Unhealthy);

        t.record(ProbeOutcome::Pass);
        t.record(ProbeOutcome::Pass);
        assert_eq!(t.status(), TargetHealth::Unhealthy);
        assert_eq!(t.record(ProbeOutcome::Pass), TargetHealth::Healthy);
    }
}
