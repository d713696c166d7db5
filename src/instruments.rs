//! Instruments facade
//!
//! One entry point for the bench: opens the multimeter and the source by bus address,
//! wraps them in a [`SweepController`], and exposes the session operations plus read
//! accessors for the active configuration. Collaborators that need the session (plotting,
//! log writers) are handed a reference; there is no global instance.

use crate::error::SweepResult;
use crate::hardware::capabilities::{MeterDriver, SourceDriver};
use crate::hardware::gpib::{DeviceAddress, GpibBus};
use crate::hardware::keithley196::Keithley196;
use crate::hardware::keithley230::Keithley230;
use crate::sink::SampleSink;
use crate::sweep::config::{MeasureFunction, OperatingMode, SweepConfiguration};
use crate::sweep::controller::SweepController;
use crate::sweep::runner::{RunSummary, SweepRunner};
use crate::sweep::state::{Sample, SweepState};
use std::sync::Arc;
use tracing::{info, warn};

/// A multimeter and a voltage source driven as one sweep session.
pub struct Instruments {
    controller: SweepController,
}

impl Instruments {
    /// Open the Keithley 196 and Keithley 230 on `bus`.
    ///
    /// # Errors
    /// - `InvalidConfig` if `config` fails validation (checked before any bus traffic)
    /// - `OpenFailed` if either device does not answer
    pub async fn open(
        bus: Arc<dyn GpibBus>,
        multimeter_address: u8,
        source_address: u8,
        config: SweepConfiguration,
    ) -> SweepResult<Self> {
        config.validate()?;
        let meter = Keithley196::open(Arc::clone(&bus), multimeter_address).await?;
        let source = Keithley230::open(bus, source_address).await?;
        info!(multimeter_address, source_address, "instruments opened");
        Self::with_drivers(Box::new(source), Box::new(meter), config)
    }

    /// Build the session from already-opened drivers.
    pub fn with_drivers(
        source: Box<dyn SourceDriver>,
        meter: Box<dyn MeterDriver>,
        config: SweepConfiguration,
    ) -> SweepResult<Self> {
        Ok(Self {
            controller: SweepController::new(source, meter, config)?,
        })
    }

    /// Restart the sweep from `start`.
    pub fn reset(&mut self) {
        self.controller.reset();
    }

    /// Configure both instruments; `false` if either is absent or refuses.
    pub async fn setup(&mut self, function: MeasureFunction) -> bool {
        self.controller.setup(function).await
    }

    /// Configure both instruments for the configured operating mode.
    pub async fn setup_for_mode(&mut self) -> bool {
        self.controller.setup_for_mode().await
    }

    /// Take one step. See [`SweepController::step_and_acquire`].
    pub async fn step_and_acquire(&mut self, sink: &mut dyn SampleSink) -> SweepResult<Sample> {
        self.controller.step_and_acquire(sink).await
    }

    /// Whether the sweep has passed `stop`.
    pub fn done(&self) -> bool {
        self.controller.done()
    }

    /// Drive the sweep to completion with `runner`.
    pub async fn run(
        &mut self,
        runner: &SweepRunner,
        sink: &mut dyn SampleSink,
    ) -> SweepResult<RunSummary> {
        runner.run(&mut self.controller, sink).await
    }

    /// Probe both devices.
    pub async fn check_health(&mut self) -> bool {
        self.controller.check_health().await
    }

    /// Replace the sweep parameters between runs; resets the sweep.
    pub fn apply_configuration(&mut self, config: SweepConfiguration) -> SweepResult<()> {
        self.controller.reconfigure(config)
    }

    /// Leave the source in standby. Errors are logged; the session is over either way.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.controller.standby().await {
            warn!(error = %e, "could not put source in standby");
        }
    }

    /// Live sweep state.
    pub fn state(&self) -> &SweepState {
        self.controller.state()
    }

    /// Active configuration.
    pub fn configuration(&self) -> &SweepConfiguration {
        self.controller.config()
    }

    /// Underlying controller.
    pub fn controller(&self) -> &SweepController {
        &self.controller
    }

    /// Sweep start (volts).
    pub fn start(&self) -> f64 {
        self.configuration().start
    }

    /// Sweep stop (volts).
    pub fn stop(&self) -> f64 {
        self.configuration().stop
    }

    /// Coarse step magnitude (volts).
    pub fn coarse_step(&self) -> f64 {
        self.configuration().coarse_step
    }

    /// Fine step magnitude (volts).
    pub fn fine_step(&self) -> f64 {
        self.configuration().fine_step
    }

    /// Fine window half-width (volts).
    pub fn window(&self) -> f64 {
        self.configuration().window
    }

    /// Source compliance limit (amps).
    pub fn current_limit(&self) -> f64 {
        self.configuration().current_limit
    }

    /// Operating mode.
    pub fn mode(&self) -> OperatingMode {
        self.configuration().mode
    }

    /// Multimeter bus address.
    pub fn multimeter_address(&self) -> DeviceAddress {
        self.controller.meter_address()
    }

    /// Source bus address.
    pub fn source_address(&self) -> DeviceAddress {
        self.controller.source_address()
    }
}
