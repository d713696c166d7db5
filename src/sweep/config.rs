//! Sweep configuration
//!
//! A [`SweepConfiguration`] is frozen for the duration of a run. It is validated once
//! before any stepping begins; the controller only reads it afterwards.
//!
//! ```toml
//! start = -1.0
//! stop = 1.0
//! coarse_step = 0.1
//! fine_step = 0.01
//! window = 0.7
//! current_limit = 0.008
//! mode = "true_iv"
//! ```

use crate::error::{SweepError, SweepResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default sweep start (volts).
pub const DEFAULT_START: f64 = -1.0;
/// Default sweep stop (volts).
pub const DEFAULT_STOP: f64 = 1.0;
/// Default coarse step (volts).
pub const DEFAULT_COARSE_STEP: f64 = 0.1;
/// Default fine step (volts).
pub const DEFAULT_FINE_STEP: f64 = 0.01;
/// Default fine window half-width (volts).
pub const DEFAULT_WINDOW: f64 = 0.7;
/// Default source compliance limit (amps).
pub const DEFAULT_CURRENT_LIMIT: f64 = 8.0e-3;
/// Default sense resistance for `InferredCurrent` (ohms).
pub const DEFAULT_SENSE_RESISTANCE: f64 = 1000.0;
/// Smallest accepted step (volts). Requested values within this distance of zero are
/// snapped to 0.0, so a smaller fine step could never leave zero.
pub const MIN_STEP: f64 = 1.0e-6;

/// What the bench measures during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Meter wired straight across the source output
    Test,
    /// Voltage in, voltage out (transfer curves)
    VoltToVolt,
    /// Voltage across a sense resistor, reported as current
    InferredCurrent,
    /// Meter in series, measuring current directly
    #[serde(rename = "true_iv")]
    TrueIV,
}

impl OperatingMode {
    /// Meter function this mode requires.
    pub fn measure_function(self) -> MeasureFunction {
        match self {
            OperatingMode::Test | OperatingMode::VoltToVolt | OperatingMode::InferredCurrent => {
                MeasureFunction::DcVoltage
            }
            OperatingMode::TrueIV => MeasureFunction::DcCurrent,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatingMode::Test => "test",
            OperatingMode::VoltToVolt => "volt_to_volt",
            OperatingMode::InferredCurrent => "inferred_current",
            OperatingMode::TrueIV => "true_iv",
        };
        f.write_str(name)
    }
}

/// Multimeter function selected during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureFunction {
    /// Measure-as-voltage
    DcVoltage,
    /// Measure-as-current
    DcCurrent,
}

impl MeasureFunction {
    /// Unit symbol of readings taken with this function.
    pub fn unit(self) -> &'static str {
        match self {
            MeasureFunction::DcVoltage => "V",
            MeasureFunction::DcCurrent => "A",
        }
    }
}

/// Direction of travel, derived from the sign of `stop - start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDirection {
    /// `start <= stop`
    Ascending,
    /// `start > stop`
    Descending,
}

impl SweepDirection {
    /// +1.0 or -1.0.
    pub fn sign(self) -> f64 {
        match self {
            SweepDirection::Ascending => 1.0,
            SweepDirection::Descending => -1.0,
        }
    }
}

/// Parameters of one sweep.
///
/// Step sizes are magnitudes; the direction comes from `start` and `stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfiguration {
    /// First requested stimulus (volts)
    pub start: f64,
    /// Sweep ends once a stimulus beyond this value has been applied (volts)
    pub stop: f64,
    /// Step used outside the fine window (volts)
    pub coarse_step: f64,
    /// Step used inside the fine window (volts)
    pub fine_step: f64,
    /// Half-width of the fine window around zero (volts)
    pub window: f64,
    /// Source compliance limit (amps)
    pub current_limit: f64,
    /// Measurement arrangement
    pub mode: OperatingMode,
    /// Sense resistor used by `InferredCurrent` (ohms)
    #[serde(default = "default_sense_resistance")]
    pub sense_resistance: f64,
}

fn default_sense_resistance() -> f64 {
    DEFAULT_SENSE_RESISTANCE
}

impl Default for SweepConfiguration {
    fn default() -> Self {
        Self {
            start: DEFAULT_START,
            stop: DEFAULT_STOP,
            coarse_step: DEFAULT_COARSE_STEP,
            fine_step: DEFAULT_FINE_STEP,
            window: DEFAULT_WINDOW,
            current_limit: DEFAULT_CURRENT_LIMIT,
            mode: OperatingMode::TrueIV,
            sense_resistance: DEFAULT_SENSE_RESISTANCE,
        }
    }
}

impl SweepConfiguration {
    /// Check the parameter invariants.
    ///
    /// # Errors
    /// `InvalidConfig` if `fine_step < MIN_STEP`, `fine_step > coarse_step`,
    /// `window < 0`, or any value is not finite.
    pub fn validate(&self) -> SweepResult<()> {
        let fields = [
            ("start", self.start),
            ("stop", self.stop),
            ("coarse_step", self.coarse_step),
            ("fine_step", self.fine_step),
            ("window", self.window),
            ("current_limit", self.current_limit),
            ("sense_resistance", self.sense_resistance),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SweepError::InvalidConfig(format!("{} must be finite", name)));
        }
        if self.coarse_step <= 0.0 {
            return Err(SweepError::InvalidConfig(format!(
                "coarse_step must be > 0, got {}",
                self.coarse_step
            )));
        }
        if self.fine_step < MIN_STEP {
            return Err(SweepError::InvalidConfig(format!(
                "fine_step must be >= {:E}, got {}",
                MIN_STEP, self.fine_step
            )));
        }
        if self.fine_step > self.coarse_step {
            return Err(SweepError::InvalidConfig(format!(
                "fine_step ({}) must not exceed coarse_step ({})",
                self.fine_step, self.coarse_step
            )));
        }
        if self.window < 0.0 {
            return Err(SweepError::InvalidConfig(format!(
                "window must be >= 0, got {}",
                self.window
            )));
        }
        if self.current_limit <= 0.0 {
            return Err(SweepError::InvalidConfig(format!(
                "current_limit must be > 0, got {}",
                self.current_limit
            )));
        }
        if self.mode == OperatingMode::InferredCurrent && self.sense_resistance <= 0.0 {
            return Err(SweepError::InvalidConfig(format!(
                "sense_resistance must be > 0 in inferred_current mode, got {}",
                self.sense_resistance
            )));
        }
        Ok(())
    }

    /// Direction implied by `start` and `stop`.
    pub fn direction(&self) -> SweepDirection {
        if self.stop >= self.start {
            SweepDirection::Ascending
        } else {
            SweepDirection::Descending
        }
    }

    /// Coarse step with the direction's sign applied.
    pub fn signed_coarse_step(&self) -> f64 {
        self.direction().sign() * self.coarse_step
    }

    /// Fine step with the direction's sign applied.
    pub fn signed_fine_step(&self) -> f64 {
        self.direction().sign() * self.fine_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn defaults_are_valid() {
        let config = SweepConfiguration::default();
        config.validate().unwrap();
        assert_eq!(config.direction(), SweepDirection::Ascending);
        assert_eq!(config.mode.measure_function(), MeasureFunction::DcCurrent);
    }

    #[test]
    fn rejects_bad_steps_and_window() {
        let cases = [
            SweepConfiguration {
                coarse_step: 0.0,
                ..Default::default()
            },
            SweepConfiguration {
                fine_step: -0.01,
                ..Default::default()
            },
            SweepConfiguration {
                fine_step: 5.0e-7,
                ..Default::default()
            },
            SweepConfiguration {
                fine_step: 0.2,
                coarse_step: 0.1,
                ..Default::default()
            },
            SweepConfiguration {
                window: -0.1,
                ..Default::default()
            },
            SweepConfiguration {
                start: f64::NAN,
                ..Default::default()
            },
        ];
        for config in cases {
            let err = config.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfig, "{:?}", config);
        }
    }

    #[test]
    fn fine_equal_to_coarse_and_zero_window_are_allowed() {
        let config = SweepConfiguration {
            fine_step: 0.1,
            coarse_step: 0.1,
            window: 0.0,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn smallest_fine_step_is_accepted() {
        let config = SweepConfiguration {
            start: 0.0,
            fine_step: MIN_STEP,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn descending_sweep_negates_steps() {
        let config = SweepConfiguration {
            start: 1.0,
            stop: -1.0,
            ..Default::default()
        };
        assert_eq!(config.direction(), SweepDirection::Descending);
        assert_eq!(config.signed_coarse_step(), -0.1);
        assert_eq!(config.signed_fine_step(), -0.01);
    }

    #[test]
    fn round_trips_through_toml_and_json() {
        let config = SweepConfiguration {
            start: -2.5,
            stop: 0.75,
            coarse_step: 0.25,
            fine_step: 0.005,
            window: 0.3,
            current_limit: 1.0e-3,
            mode: OperatingMode::InferredCurrent,
            sense_resistance: 470.0,
        };

        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("mode = \"inferred_current\""));
        let back: SweepConfiguration = toml::from_str(&text).unwrap();
        assert_eq!(back, config);

        let json = serde_json::to_string(&config).unwrap();
        let back: SweepConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn true_iv_mode_uses_legacy_name() {
        let json = serde_json::to_string(&OperatingMode::TrueIV).unwrap();
        assert_eq!(json, "\"true_iv\"");
        assert_eq!(OperatingMode::TrueIV.to_string(), "true_iv");
    }
}
