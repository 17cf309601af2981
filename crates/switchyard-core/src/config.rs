//! switchyard.toml configuration parser and resolved rollout settings.
//!
//! The file format uses optional fields and duration strings ("5s",
//! "10m"); `FileConfig::resolve` fills defaults and produces the typed
//! `RolloutConfig` the orchestrator consumes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Resolved configuration ────────────────────────────────────────

/// Fully resolved rollout settings.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Canary ramp steps, strictly increasing, ending at 1.0.
    pub ramp_steps: Vec<f64>,
    /// Hard budget for the health-checking phase.
    pub health_check_timeout: Duration,
    pub probe: ProbeConfig,
    pub shift: ShiftConfig,
    pub provision: ProvisionConfig,
}

/// Health probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// HTTP path to probe (e.g., "/healthz").
    pub endpoint: String,
    /// Fixed interval between probes of a target.
    pub interval: Duration,
    /// Timeout per probe.
    pub timeout: Duration,
    /// Consecutive successes before Unknown → Healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before Healthy → Unhealthy.
    pub unhealthy_threshold: u32,
    /// How long Unknown targets are tolerated before they count
    /// against aggregate health.
    pub grace_period: Duration,
}

/// Traffic shift settings.
#[derive(Debug, Clone)]
pub struct ShiftConfig {
    /// How long to wait for the load balancer to confirm a split.
    pub confirm_timeout: Duration,
    /// Poll interval while waiting for confirmation.
    pub confirm_interval: Duration,
    /// Observation window after each confirmed ramp step, during which
    /// candidate health is watched before the next step is applied.
    pub step_bake: Duration,
    /// Weight-update retries before escalating to rollback.
    pub retry_limit: u32,
    /// Initial backoff between retries; doubles per attempt.
    pub retry_backoff: Duration,
}

/// Provisioning retry settings for transient platform errors.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub retry_limit: u32,
    pub retry_backoff: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            ramp_steps: vec![0.10, 0.50, 1.0],
            health_check_timeout: Duration::from_secs(600),
            probe: ProbeConfig::default(),
            shift: ShiftConfig::default(),
            provision: ProvisionConfig::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            endpoint: "/healthz".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            grace_period: Duration::from_secs(30),
        }
    }
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(30),
            confirm_interval: Duration::from_millis(500),
            step_bake: Duration::from_secs(10),
            retry_limit: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

impl RolloutConfig {
    /// Validate invariants the state machine relies on.
    ///
    /// Ramp steps must be strictly increasing within (0, 1] and end at
    /// 1.0, so that the shift phase is monotonic and terminates.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ramp_steps.is_empty() {
            anyhow::bail!("ramp_steps must not be empty");
        }
        let mut prev = 0.0;
        for &step in &self.ramp_steps {
            if step <= prev || step > 1.0 {
                anyhow::bail!(
                    "ramp_steps must be strictly increasing in (0, 1], got {step} after {prev}"
                );
            }
            prev = step;
        }
        if (prev - 1.0).abs() > f64::EPSILON {
            anyhow::bail!("ramp_steps must end at 1.0, got {prev}");
        }
        Ok(())
    }
}

// ── File format ───────────────────────────────────────────────────

/// Top-level switchyard.toml layout. All fields optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub store: Option<StoreSection>,
    pub rollout: Option<RolloutSection>,
    pub probe: Option<ProbeSection>,
    pub shift: Option<ShiftSection>,
    pub provision: Option<ProvisionSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    /// Directory for the state database.
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutSection {
    pub ramp_steps: Option<Vec<f64>>,
    pub health_check_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeSection {
    pub endpoint: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    pub grace_period: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShiftSection {
    pub confirm_timeout: Option<String>,
    pub confirm_interval: Option<String>,
    pub step_bake: Option<String>,
    pub retry_limit: Option<u32>,
    pub retry_backoff: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionSection {
    pub retry_limit: Option<u32>,
    pub retry_backoff: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve file values over defaults into a validated `RolloutConfig`.
    pub fn resolve(&self) -> anyhow::Result<RolloutConfig> {
        let mut config = RolloutConfig::default();

        if let Some(rollout) = &self.rollout {
            if let Some(steps) = &rollout.ramp_steps {
                config.ramp_steps = steps.clone();
            }
            if let Some(s) = &rollout.health_check_timeout {
                config.health_check_timeout = parse_required(s, "health_check_timeout")?;
            }
        }
        if let Some(probe) = &self.probe {
            if let Some(endpoint) = &probe.endpoint {
                config.probe.endpoint = endpoint.clone();
            }
            if let Some(s) = &probe.interval {
                config.probe.interval = parse_required(s, "probe.interval")?;
            }
            if let Some(s) = &probe.timeout {
                config.probe.timeout = parse_required(s, "probe.timeout")?;
            }
            if let Some(n) = probe.healthy_threshold {
                config.probe.healthy_threshold = n;
            }
            if let Some(n) = probe.unhealthy_threshold {
                config.probe.unhealthy_threshold = n;
            }
            if let Some(s) = &probe.grace_period {
                config.probe.grace_period = parse_required(s, "probe.grace_period")?;
            }
        }
        if let Some(shift) = &self.shift {
            if let Some(s) = &shift.confirm_timeout {
                config.shift.confirm_timeout = parse_required(s, "shift.confirm_timeout")?;
            }
            if let Some(s) = &shift.confirm_interval {
                config.shift.confirm_interval = parse_required(s, "shift.confirm_interval")?;
            }
            if let Some(s) = &shift.step_bake {
                config.shift.step_bake = parse_required(s, "shift.step_bake")?;
            }
            if let Some(n) = shift.retry_limit {
                config.shift.retry_limit = n;
            }
            if let Some(s) = &shift.retry_backoff {
                config.shift.retry_backoff = parse_required(s, "shift.retry_backoff")?;
            }
        }
        if let Some(provision) = &self.provision {
            if let Some(n) = provision.retry_limit {
                config.provision.retry_limit = n;
            }
            if let Some(s) = &provision.retry_backoff {
                config.provision.retry_backoff = parse_required(s, "provision.retry_backoff")?;
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_required(s: &str, field: &str) -> anyhow::Result<Duration> {
    parse_duration(s).ok_or_else(|| anyhow::anyhow!("invalid duration for {field}: {s:?}"))
}

/// Parse a duration string like "5s", "500ms", "1m".
///
/// A bare number is interpreted as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn defaults_are_valid() {
        RolloutConfig::default().validate().unwrap();
    }

    #[test]
    fn default_ramp_is_canary_shaped() {
        let config = RolloutConfig::default();
        assert_eq!(config.ramp_steps, vec![0.10, 0.50, 1.0]);
        assert_eq!(config.health_check_timeout, Duration::from_secs(600));
        assert_eq!(config.probe.healthy_threshold, 3);
        assert_eq!(config.probe.unhealthy_threshold, 3);
    }

    #[test]
    fn validate_rejects_non_monotonic_ramp() {
        let config = RolloutConfig {
            ramp_steps: vec![0.5, 0.1, 1.0],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_ramp_not_ending_at_full() {
        let config = RolloutConfig {
            ramp_steps: vec![0.1, 0.5],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_ramp() {
        let config = RolloutConfig {
            ramp_steps: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_overrides_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            [rollout]
            ramp_steps = [0.25, 1.0]
            health_check_timeout = "2m"

            [probe]
            interval = "1s"
            unhealthy_threshold = 5

            [shift]
            retry_limit = 1
            "#,
        )
        .unwrap();

        let config = file.resolve().unwrap();
        assert_eq!(config.ramp_steps, vec![0.25, 1.0]);
        assert_eq!(config.health_check_timeout, Duration::from_secs(120));
        assert_eq!(config.probe.interval, Duration::from_secs(1));
        assert_eq!(config.probe.unhealthy_threshold, 5);
        assert_eq!(config.shift.retry_limit, 1);
        // Untouched fields keep defaults.
        assert_eq!(config.probe.endpoint, "/healthz");
    }

    #[test]
    fn resolve_rejects_bad_duration() {
        let file: FileConfig = toml::from_str(
            r#"
            [probe]
            interval = "soon"
            "#,
        )
        .unwrap();
        assert!(file.resolve().is_err());
    }

    #[test]
    fn empty_file_resolves_to_defaults() {
        let file: FileConfig = toml::from_str("").unwrap();
        let config = file.resolve().unwrap();
        assert_eq!(config.ramp_steps, RolloutConfig::default().ramp_steps);
    }
}
