//! Keithley 230 Programmable Voltage Source Driver
//!
//! Protocol Overview:
//! - Device-dependent commands terminated with `X` (execute)
//! - `V<volts>X` sets the output voltage, sent at full precision
//! - `I<amps>X` sets the current (compliance) limit
//! - `F0X` standby, `F1X` operate
//! - `D0X` displays the source value
//!
//! The source keeps its last commanded output until told otherwise; settling is the
//! caller's concern.

use crate::error::SweepResult;
use crate::hardware::capabilities::{Configurable, Instrument, SourceSetting, StimulusOutput};
use crate::hardware::gpib::{DeviceAddress, DeviceHandle, GpibBus};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Factory GPIB address of the bench voltage source.
pub const DEFAULT_ADDRESS: DeviceAddress = DeviceAddress::fixed(13);

/// Driver for the Keithley 230 voltage source
///
/// Implements `Instrument + Configurable<Setting = SourceSetting> + StimulusOutput`.
#[derive(Debug)]
pub struct Keithley230 {
    handle: DeviceHandle,
    output: Option<f64>,
}

impl Keithley230 {
    /// Open the source at `address`.
    ///
    /// # Errors
    /// `OpenFailed` if nothing answers at `address`.
    pub async fn open(bus: Arc<dyn GpibBus>, address: u8) -> SweepResult<Self> {
        let handle = DeviceHandle::open(bus, address).await?;
        info!(address, "Keithley 230 opened");
        Ok(Self {
            handle,
            output: None,
        })
    }

    /// Last voltage successfully commanded, `None` in standby.
    pub fn output(&self) -> Option<f64> {
        self.output
    }

    fn voltage_command(value: f64) -> String {
        format!("V{}X", value)
    }

    fn limit_command(current_limit: f64) -> String {
        format!("I{:E}X", current_limit)
    }
}

#[async_trait]
impl Instrument for Keithley230 {
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
impl Configurable for Keithley230 {
    type Setting = SourceSetting;

    async fn configure(&mut self, setting: &SourceSetting) -> SweepResult<()> {
        self.handle
            .write(&Self::limit_command(setting.current_limit))
            .await?;
        self.handle.write("F1X").await?;
        self.handle.write("D0X").await?;
        debug!(
            address = %self.handle.address(),
            limit = setting.current_limit,
            "Keithley 230 operating"
        );
        Ok(())
    }
}

#[async_trait]
impl StimulusOutput for Keithley230 {
    async fn set_stimulus(&mut self, value: f64) -> SweepResult<()> {
        self.handle.write(&Self::voltage_command(value)).await?;
        self.output = Some(value);
        Ok(())
    }

    async fn standby(&mut self) -> SweepResult<()> {
        self.handle.write("F0X").await?;
        self.output = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hardware::mock::MockGpibBus;

    async fn open_source() -> (Arc<MockGpibBus>, Keithley230) {
        let bus = Arc::new(MockGpibBus::new());
        bus.attach(13);
        let source = Keithley230::open(bus.clone(), 13).await.unwrap();
        (bus, source)
    }

    #[test]
    fn formats_commands() {
        assert_eq!(Keithley230::voltage_command(-1.0), "V-1X");
        assert_eq!(Keithley230::voltage_command(0.05), "V0.05X");
        assert_eq!(Keithley230::voltage_command(-0.000001), "V-0.000001X");
        assert_eq!(Keithley230::limit_command(8.0e-3), "I8E-3X");
    }

    #[tokio::test]
    async fn configure_sets_limit_then_operates() {
        let (bus, mut source) = open_source().await;
        let setting = SourceSetting {
            current_limit: 8.0e-3,
        };
        source.configure(&setting).await.unwrap();
        source.configure(&setting).await.unwrap();
        assert_eq!(
            bus.writes_to(13),
            vec!["I8E-3X", "F1X", "D0X", "I8E-3X", "F1X", "D0X"]
        );
    }

    #[tokio::test]
    async fn sub_millivolt_steps_reach_the_source() {
        let (bus, mut source) = open_source().await;
        source.set_stimulus(0.00012).await.unwrap();
        source.set_stimulus(0.00014).await.unwrap();
        assert_eq!(bus.writes_to(13), vec!["V0.00012X", "V0.00014X"]);
        assert_eq!(source.output(), Some(0.00014));
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_output() {
        let (bus, mut source) = open_source().await;
        source.set_stimulus(0.5).await.unwrap();

        bus.fail_next_write(13);
        let err = source.set_stimulus(0.6).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);
        assert_eq!(source.output(), Some(0.5));

        source.standby().await.unwrap();
        assert_eq!(source.output(), None);
        assert_eq!(bus.writes_to(13).last().map(String::as_str), Some("F0X"));
    }

    #[tokio::test]
    async fn unplugged_source_fails_health_check() {
        let (bus, mut source) = open_source().await;
        bus.detach(13);
        assert!(!source.check_health().await);
        let err = source.set_stimulus(0.1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }
}
