//! Instrument layer
//!
//! - [`gpib`]: bus trait and device handles
//! - [`capabilities`]: the traits the sweep engine programs against
//! - [`keithley196`] / [`keithley230`]: bench drivers
//! - [`prologix`]: serial GPIB controller (`instrument_serial` feature)
//! - [`mock`]: scripted bus and simulated bench

pub mod capabilities;
pub mod gpib;
pub mod keithley196;
pub mod keithley230;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod prologix;

pub use capabilities::{MeterDriver, SourceDriver, SourceSetting};
pub use gpib::{DeviceAddress, DeviceHandle, GpibBus};
pub use keithley196::Keithley196;
pub use keithley230::Keithley230;
pub use mock::{DeviceModel, MockGpibBus, SimulatedBench};
#[cfg(feature = "instrument_serial")]
pub use prologix::PrologixBus;
