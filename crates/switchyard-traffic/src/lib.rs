//! switchyard-traffic — traffic shifting for Switchyard rollouts.
//!
//! Moves routed traffic share between active and candidate target
//! groups at the load-balancer seam. The ramp is monotonic in one
//! direction per rollout phase: during rollout the candidate fraction
//! only increases; during rollback it is reset to zero in one step.

pub mod ramp;
pub mod shifter;

pub use ramp::{RampPlan, SPLIT_EPSILON};
pub use shifter::{TrafficError, TrafficResult, TrafficShifter};
