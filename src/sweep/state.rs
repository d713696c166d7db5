//! Live sweep state and the samples it produces.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Step granularity currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepMode {
    /// Outside the fine window
    Coarse,
    /// Inside the fine window
    Fine,
}

impl fmt::Display for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepMode::Coarse => f.write_str("coarse"),
            StepMode::Fine => f.write_str("fine"),
        }
    }
}

/// Mutable state of a sweep, owned by the controller.
///
/// Created by `reset()`, mutated only by `step_and_acquire()`.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepState {
    /// Steps taken since the last reset (failed steps included)
    pub step_number: u64,
    /// Stimulus the next step will apply
    pub requested_value: f64,
    /// Stimulus most recently written to the source
    pub last_applied_value: Option<f64>,
    /// Most recent successful measurement
    pub last_measurement: Option<f64>,
    /// Granularity used to reach `requested_value`
    pub step_mode: StepMode,
}

impl SweepState {
    /// Fresh state positioned at `start`.
    pub fn new(start: f64) -> Self {
        Self {
            step_number: 0,
            requested_value: start,
            last_applied_value: None,
            last_measurement: None,
            step_mode: StepMode::Coarse,
        }
    }
}

/// One (stimulus, response) pair.
///
/// `response` is `None` when the step was consumed but its measurement failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Stimulus commanded for this step (volts)
    pub stimulus: f64,
    /// Measured response in the unit of the meter function
    pub response: Option<f64>,
    /// 1-based step number
    pub step_index: u64,
}

impl Sample {
    /// Whether the measurement succeeded.
    pub fn is_valid(&self) -> bool {
        self.response.is_some()
    }
}
