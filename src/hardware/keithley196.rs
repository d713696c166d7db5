//! Keithley 196 System DMM Driver
//!
//! Protocol Overview:
//! - Device-dependent commands (not SCPI), each terminated with `X` (execute)
//! - `F0X` selects DC volts, `F3X` selects DC amps
//! - Readings are returned with a 4-character prefix, e.g. `NDCV+1.23456E+0`:
//!   - 1st character: `N` normal, `O` overflow
//!   - characters 2-4: function (`DCV`, `DCA`, ...)
//!
//! An overflow reading is reported as `ReadFailed`; the sweep records it as a failed step.

use crate::error::{SweepError, SweepResult};
use crate::hardware::capabilities::{Configurable, Instrument, Readable};
use crate::hardware::gpib::{DeviceAddress, DeviceHandle, GpibBus};
use crate::sweep::config::MeasureFunction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Factory GPIB address of the bench multimeter.
pub const DEFAULT_ADDRESS: DeviceAddress = DeviceAddress::fixed(3);

const PREFIX_LEN: usize = 4;

/// Driver for the Keithley 196 multimeter
///
/// Implements `Instrument + Configurable<Setting = MeasureFunction> + Readable`.
#[derive(Debug)]
pub struct Keithley196 {
    handle: DeviceHandle,
    function: Option<MeasureFunction>,
    prefix: Option<String>,
}

impl Keithley196 {
    /// Open the meter at `address`.
    ///
    /// # Errors
    /// `OpenFailed` if nothing answers at `address`.
    pub async fn open(bus: Arc<dyn GpibBus>, address: u8) -> SweepResult<Self> {
        let handle = DeviceHandle::open(bus, address).await?;
        info!(address, "Keithley 196 opened");
        Ok(Self {
            handle,
            function: None,
            prefix: None,
        })
    }

    /// Function selected by the last successful `configure`.
    pub fn function(&self) -> Option<MeasureFunction> {
        self.function
    }

    /// Prefix of the last reading (e.g. `NDCV`).
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn function_command(function: MeasureFunction) -> &'static str {
        match function {
            MeasureFunction::DcVoltage => "F0X",
            MeasureFunction::DcCurrent => "F3X",
        }
    }

    /// Split a raw reading into its prefix and value.
    fn parse_reading(response: &str) -> Result<(&str, f64), String> {
        let trimmed = response.trim();
        if trimmed.len() <= PREFIX_LEN || !trimmed.is_char_boundary(PREFIX_LEN) {
            return Err(format!("short reading '{}'", trimmed));
        }
        let (prefix, value) = trimmed.split_at(PREFIX_LEN);
        if prefix.starts_with('O') {
            return Err(format!("overflow reading '{}'", trimmed));
        }
        value
            .trim()
            .parse::<f64>()
            .map(|v| (prefix, v))
            .map_err(|e| format!("unparseable reading '{}': {}", trimmed, e))
    }
}

#[async_trait]
impl Instrument for Keithley196 {
    fn address(&self) -> DeviceAddress {
        self.handle.address()
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn check_health(&mut self) -> bool {
        self.handle.probe().await
    }
}

#[async_trait]
impl Configurable for Keithley196 {
    type Setting = MeasureFunction;

    async fn configure(&mut self, setting: &MeasureFunction) -> SweepResult<()> {
        self.handle.write(Self::function_command(*setting)).await?;
        self.function = Some(*setting);
        debug!(address = %self.handle.address(), function = ?setting, "Keithley 196 function set");
        Ok(())
    }
}

#[async_trait]
impl Readable for Keithley196 {
    async fn read_measurement(&mut self) -> SweepResult<f64> {
        let response = self.handle.read().await?;
        match Self::parse_reading(&response) {
            Ok((prefix, value)) => {
                if self.prefix.as_deref() != Some(prefix) {
                    self.prefix = Some(prefix.to_string());
                }
                Ok(value)
            }
            Err(reason) => Err(SweepError::ReadFailed {
                address: self.handle.address(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hardware::mock::MockGpibBus;

    #[test]
    fn parses_prefixed_readings() {
        assert_eq!(
            Keithley196::parse_reading("NDCV+1.23456E+0\r\n").unwrap(),
            ("NDCV", 1.23456)
        );
        assert_eq!(
            Keithley196::parse_reading("NDCA-2.5000E-3").unwrap(),
            ("NDCA", -2.5e-3)
        );
        assert!(Keithley196::parse_reading("ODCV+9.99999E+9").is_err());
        assert!(Keithley196::parse_reading("NDCV").is_err());
        assert!(Keithley196::parse_reading("NDCVgarbage").is_err());
    }

    #[tokio::test]
    async fn configure_sends_function_commands() {
        let bus = Arc::new(MockGpibBus::new());
        bus.attach(3);
        let mut meter = Keithley196::open(bus.clone(), 3).await.unwrap();

        meter.configure(&MeasureFunction::DcCurrent).await.unwrap();
        meter.configure(&MeasureFunction::DcVoltage).await.unwrap();
        assert_eq!(bus.writes_to(3), vec!["F3X", "F0X"]);
        assert_eq!(meter.function(), Some(MeasureFunction::DcVoltage));
    }

    #[tokio::test]
    async fn overflow_is_a_read_failure() {
        let bus = Arc::new(MockGpibBus::new());
        bus.attach(3);
        bus.push_response(3, "NDCA+1.00000E-3");
        bus.push_response(3, "ODCA+9.99999E+9");
        let mut meter = Keithley196::open(bus, 3).await.unwrap();

        assert_eq!(meter.read_measurement().await.unwrap(), 1.0e-3);
        assert_eq!(meter.prefix(), Some("NDCA"));
        let err = meter.read_measurement().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadFailed);
        assert!(meter.is_open());
    }

    #[tokio::test]
    async fn open_fails_at_wrong_address() {
        let bus = Arc::new(MockGpibBus::new());
        bus.attach(3);
        let err = Keithley196::open(bus, 4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OpenFailed);
    }
}
