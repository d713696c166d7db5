//! Application settings using Figment
//!
//! Settings are layered:
//! 1. built-in defaults (the bench addresses and the default sweep)
//! 2. a TOML file (`iv_sweep.toml` unless another path is given)
//! 3. environment variables prefixed with `IV_SWEEP_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use iv_sweep::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // IV_SWEEP_SWEEP__WINDOW=0.3 overrides [sweep] window
//! let settings = Settings::load_from("iv_sweep.toml")?;
//! settings.validate()?;
//! println!("sweeping {} -> {}", settings.sweep.start, settings.sweep.stop);
//! # Ok(())
//! # }
//! ```

use crate::error::{SweepError, SweepResult};
use crate::hardware::keithley196;
use crate::hardware::keithley230;
use crate::hardware::gpib::MAX_GPIB_ADDRESS;
use crate::hardware::mock::DeviceModel;
use crate::logging::{parse_log_level, OutputFormat};
use crate::sweep::config::SweepConfiguration;
use crate::sweep::runner::DEFAULT_MAX_CONSECUTIVE_FAILURES;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default settings file.
pub const DEFAULT_SETTINGS_FILE: &str = "iv_sweep.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "IV_SWEEP_";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging
    pub application: ApplicationSettings,
    /// Bus and device addresses
    pub instruments: InstrumentSettings,
    /// Sweep parameters
    pub sweep: SweepConfiguration,
    /// Output files and run policy
    pub run: RunSettings,
    /// Simulated bench
    pub simulation: SimulationSettings,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Which bus the instruments are reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// In-process simulated bench
    Simulated,
    /// Prologix GPIB-USB controller on `serial_port`
    Prologix,
}

/// Bus and address settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// GPIB address of the multimeter
    pub multimeter_address: u8,
    /// GPIB address of the voltage source
    pub source_address: u8,
    /// Bus implementation
    pub bus: BusKind,
    /// Serial port of the GPIB controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    /// Bus read timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            multimeter_address: keithley196::DEFAULT_ADDRESS.value(),
            source_address: keithley230::DEFAULT_ADDRESS.value(),
            bus: BusKind::Simulated,
            serial_port: None,
            timeout_ms: 3000,
        }
    }
}

/// Output and run-policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Bench log file
    pub output: PathBuf,
    /// Optional CSV copy of the samples
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv_output: Option<PathBuf>,
    /// Abort after this many failed steps in a row
    pub max_consecutive_failures: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            output: PathBuf::from("keithley.log"),
            csv_output: None,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// Simulated bench settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Device under test
    pub model: DeviceModel,
    /// Simulated bus latency in milliseconds
    pub latency_ms: u64,
}

impl Settings {
    /// Layered figment for `path`: defaults, then the file, then the environment.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load from the default settings file and the environment.
    pub fn load() -> SweepResult<Self> {
        Self::load_from(DEFAULT_SETTINGS_FILE)
    }

    /// Load from `path` and the environment. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Write the settings as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> SweepResult<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> SweepResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SweepError::InvalidConfig(format!("cannot serialize settings: {}", e)))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SweepResult<()> {
        parse_log_level(&self.application.log_level).map_err(SweepError::InvalidConfig)?;

        let addresses = [
            ("multimeter_address", self.instruments.multimeter_address),
            ("source_address", self.instruments.source_address),
        ];
        for (name, address) in addresses {
            if address > MAX_GPIB_ADDRESS {
                return Err(SweepError::InvalidConfig(format!(
                    "{} {} is outside 0..={}",
                    name, address, MAX_GPIB_ADDRESS
                )));
            }
        }
        if self.instruments.multimeter_address == self.instruments.source_address {
            return Err(SweepError::InvalidConfig(format!(
                "multimeter and source share GPIB address {}",
                self.instruments.source_address
            )));
        }
        if self.instruments.bus == BusKind::Prologix && self.instruments.serial_port.is_none() {
            return Err(SweepError::InvalidConfig(
                "bus = \"prologix\" requires serial_port".to_string(),
            ));
        }
        if self.run.max_consecutive_failures == 0 {
            return Err(SweepError::InvalidConfig(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        self.sweep.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sweep::config::OperatingMode;

    #[test]
    fn defaults_match_the_bench() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.instruments.multimeter_address, 3);
        assert_eq!(settings.instruments.source_address, 13);
        assert_eq!(settings.run.output, PathBuf::from("keithley.log"));
        assert_eq!(settings.sweep.mode, OperatingMode::TrueIV);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");

        let mut settings = Settings::default();
        settings.sweep.start = 1.5;
        settings.sweep.stop = -1.5;
        settings.sweep.window = 0.25;
        settings.sweep.mode = OperatingMode::VoltToVolt;
        settings.instruments.multimeter_address = 7;
        settings.run.csv_output = Some(PathBuf::from("out.csv"));
        settings.simulation.model = DeviceModel::Resistor { ohms: 470.0 };
        settings.save(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[sweep]\nwindow = 0.1\n\n[instruments]\nsource_address = 14\n").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.sweep.window, 0.1);
        assert_eq!(settings.sweep.coarse_step, 0.1);
        assert_eq!(settings.instruments.source_address, 14);
        assert_eq!(settings.instruments.multimeter_address, 3);
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("iv_sweep.toml", "[sweep]\nstop = 2.0\n")?;
            jail.set_env("IV_SWEEP_SWEEP__STOP", "3.0");
            jail.set_env("IV_SWEEP_APPLICATION__LOG_LEVEL", "debug");

            let settings = Settings::load().map_err(|e| e.to_string())?;
            assert_eq!(settings.sweep.stop, 3.0);
            assert_eq!(settings.application.log_level, "debug");
            Ok(())
        });
    }

    #[test]
    fn rejects_shared_addresses_and_bad_level() {
        let mut settings = Settings::default();
        settings.instruments.source_address = 3;
        assert_eq!(settings.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert_eq!(settings.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        let mut settings = Settings::default();
        settings.instruments.bus = BusKind::Prologix;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn malformed_file_is_a_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[sweep]\nstart = \"minus one\"\n").unwrap();
        let err = Settings::load_from(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Settings);
    }
}
