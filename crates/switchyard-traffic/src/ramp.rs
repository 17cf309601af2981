//! Canary ramp plans.
//!
//! A ramp plan is the monotonically increasing sequence of candidate
//! traffic fractions a rollout walks through. Rollback never walks the
//! plan backwards; it resets to zero in one step.

/// Tolerance when comparing traffic fractions.
pub const SPLIT_EPSILON: f64 = 1e-6;

/// A validated, strictly increasing traffic ramp ending at 1.0.
#[derive(Debug, Clone)]
pub struct RampPlan {
    steps: Vec<f64>,
}

impl RampPlan {
    /// Build a plan from explicit steps.
    ///
    /// Steps must be strictly increasing within (0, 1] and end at 1.0.
    pub fn new(steps: Vec<f64>) -> Result<Self, String> {
        if steps.is_empty() {
            return Err("ramp plan must have at least one step".to_string());
        }
        let mut prev = 0.0;
        for &step in &steps {
            if step <= prev || step > 1.0 {
                return Err(format!(
                    "ramp steps must be strictly increasing in (0, 1], got {step} after {prev}"
                ));
            }
            prev = step;
        }
        if (prev - 1.0).abs() > SPLIT_EPSILON {
            return Err(format!("ramp must end at 1.0, got {prev}"));
        }
        Ok(Self { steps })
    }

    /// The next step strictly above `current`, or `None` when the ramp
    /// is finished. Resuming mid-ramp lands on the first unapplied step.
    pub fn next_step(&self, current: f64) -> Option<f64> {
        self.steps
            .iter()
            .copied()
            .find(|&s| s > current + SPLIT_EPSILON)
    }

    /// Whether `current` has reached full traffic.
    pub fn complete(current: f64) -> bool {
        current >= 1.0 - SPLIT_EPSILON
    }

    pub fn steps(&self) -> &[f64] {
        &self.steps
    }
}

impl Default for RampPlan {
    /// The standard canary ramp: 10% → 50% → 100%.
    fn default() -> Self {
        Self {
            steps: vec![0.10, 0.50, 1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ramp_walks_up() {
        let plan = RampPlan::default();
        assert_eq!(plan.next_step(0.0), Some(0.10));
        assert_eq!(plan.next_step(0.10), Some(0.50));
        assert_eq!(plan.next_step(0.50), Some(1.0));
        assert_eq!(plan.next_step(1.0), None);
    }

    #[test]
    fn resume_lands_on_first_unapplied_step() {
        let plan = RampPlan::default();
        // A crash left the split at 0.3; the next step is 0.5.
        assert_eq!(plan.next_step(0.3), Some(0.50));
    }

    #[test]
    fn single_step_plan_is_blue_green() {
        let plan = RampPlan::new(vec![1.0]).unwrap();
        assert_eq!(plan.next_step(0.0), Some(1.0));
        assert_eq!(plan.next_step(1.0), None);
    }

    #[test]
    fn rejects_bad_plans() {
        assert!(RampPlan::new(vec![]).is_err());
        assert!(RampPlan::new(vec![0.5, 0.1, 1.0]).is_err());
        assert!(RampPlan::new(vec![0.1, 0.5]).is_err());
        assert!(RampPlan::new(vec![0.0, 1.0]).is_err());
        assert!(RampPlan::new(vec![0.5, 1.5]).is_err());
    }

    #[test]
    fn complete_tolerates_float_noise() {
        assert!(RampPlan::complete(1.0));
        assert!(RampPlan::complete(0.9999999));
        assert!(!RampPlan::complete(0.99));
    }
}
