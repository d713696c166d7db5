//! Instrument Capabilities
//!
//! This module defines the fine-grained capability traits an instrument driver
//! implements. The sweep engine never sees a concrete device type; it asks for the
//! capabilities it needs:
//!
//! - a voltage source implements: `Instrument + Configurable<Setting = SourceSetting> + StimulusOutput`
//! - a multimeter implements: `Instrument + Configurable<Setting = MeasureFunction> + Readable`
//!
//! The two combined traits, [`SourceDriver`] and [`MeterDriver`], exist for trait objects
//! and are implemented automatically through blanket impls.
//!
//! # Contract
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Returns the crate's typed [`SweepResult`]
//! - Fails with `NotConnected` without bus I/O once the device handle is closed
//! - Never retries internally; retry policy belongs to the caller
//!
//! # Example
//!
//! ```rust,ignore
//! async fn one_point<S, M>(source: &mut S, meter: &mut M, volts: f64) -> SweepResult<f64>
//! where
//!     S: StimulusOutput,
//!     M: Readable,
//! {
//!     source.set_stimulus(volts).await?;
//!     tokio::time::sleep(SETTLE_TIME).await;
//!     meter.read_measurement().await
//! }
//! ```

use crate::error::SweepResult;
use crate::hardware::gpib::DeviceAddress;
use crate::sweep::config::MeasureFunction;
use async_trait::async_trait;

/// Capability: Bus Presence
///
/// Every instrument sits at one bus address and can be probed.
#[async_trait]
pub trait Instrument: Send {
    /// Bus address the device was opened at.
    fn address(&self) -> DeviceAddress;

    /// Whether the underlying handle is open.
    fn is_open(&self) -> bool;

    /// Best-effort presence probe.
    ///
    /// `false` means the device must be treated as absent for the rest of the
    /// session; the handle is closed and never reopened.
    async fn check_health(&mut self) -> bool;
}

/// Capability: Function Configuration
///
/// Sets the measurement or source function and limits.
///
/// # Contract
/// - Idempotent: issuing the same setting twice leaves the device in the same state
#[async_trait]
pub trait Configurable: Send {
    /// Device-specific setting type
    type Setting: Send + Sync;

    /// Apply a setting.
    async fn configure(&mut self, setting: &Self::Setting) -> SweepResult<()>;
}

/// Capability: Stimulus Output
///
/// Devices that drive a programmable output (voltage sources, SMUs).
///
/// # Contract
/// - `set_stimulus` commands the new value and returns without waiting for settling
#[async_trait]
pub trait StimulusOutput: Send {
    /// Command the output to `value` (volts).
    async fn set_stimulus(&mut self, value: f64) -> SweepResult<()>;

    /// Put the output in standby. Default: no-op.
    async fn standby(&mut self) -> SweepResult<()> {
        Ok(())
    }
}

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (voltmeters, ammeters).
///
/// # Contract
/// - `read_measurement` blocks for the most recent conversion
/// - The caller owns any settle delay before calling it
#[async_trait]
pub trait Readable: Send {
    /// Read the most recent conversion.
    async fn read_measurement(&mut self) -> SweepResult<f64>;
}

/// Source output configuration applied during session setup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceSetting {
    /// Compliance (current) limit in amps
    pub current_limit: f64,
}

/// Combined trait for programmable voltage sources
///
/// Implement the individual traits and get this automatically via blanket impl.
pub trait SourceDriver:
    Instrument + Configurable<Setting = SourceSetting> + StimulusOutput
{
}

impl<T> SourceDriver for T where
    T: Instrument + Configurable<Setting = SourceSetting> + StimulusOutput
{
}

/// Combined trait for multimeters
///
/// Implement the individual traits and get this automatically via blanket impl.
pub trait MeterDriver: Instrument + Configurable<Setting = MeasureFunction> + Readable {}

impl<T> MeterDriver for T where T: Instrument + Configurable<Setting = MeasureFunction> + Readable {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SweepError;

    struct FixedMeter {
        address: DeviceAddress,
        open: bool,
        function: Option<MeasureFunction>,
    }

    #[async_trait]
    impl Instrument for FixedMeter {
        fn address(&self) -> DeviceAddress {
            self.address
        }

        fn is_open(&self) -> bool {
            self.open
        }

        async fn check_health(&mut self) -> bool {
            self.open
        }
    }

    #[async_trait]
    impl Configurable for FixedMeter {
        type Setting = MeasureFunction;

        async fn configure(&mut self, setting: &MeasureFunction) -> SweepResult<()> {
            self.function = Some(*setting);
            Ok(())
        }
    }

    #[async_trait]
    impl Readable for FixedMeter {
        async fn read_measurement(&mut self) -> SweepResult<f64> {
            if !self.open {
                return Err(SweepError::NotConnected {
                    address: self.address,
                });
            }
            Ok(0.123)
        }
    }

    #[tokio::test]
    async fn blanket_impl_makes_meter_driver_object() {
        let mut meter: Box<dyn MeterDriver> = Box::new(FixedMeter {
            address: DeviceAddress::new(3).unwrap(),
            open: true,
            function: None,
        });

        meter.configure(&MeasureFunction::DcCurrent).await.unwrap();
        assert_eq!(meter.read_measurement().await.unwrap(), 0.123);
        assert_eq!(meter.address().value(), 3);
        assert!(meter.check_health().await);
    }
}
