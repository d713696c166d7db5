//! Sweep engine: configuration, live state, the adaptive step controller and the
//! run-to-completion driver.

pub mod config;
pub mod controller;
pub mod runner;
pub mod state;

pub use config::{MeasureFunction, OperatingMode, SweepConfiguration, SweepDirection};
pub use controller::{plan_stimuli, SweepController, SETTLE_TIME};
pub use runner::{RunSummary, SweepRunner};
pub use state::{Sample, StepMode, SweepState};
