//! Adaptive sweep controller
//!
//! The controller owns both instrument drivers and the live [`SweepState`]. Each call to
//! [`SweepController::step_and_acquire`] applies one stimulus, waits [`SETTLE_TIME`],
//! reads the meter, hands the sample to the sink and then picks the next stimulus.
//!
//! # Step selection
//!
//! The next value is chosen from where a *coarse* step would land:
//!
//! - `|requested + coarse| >= window`: step coarse (leaving or staying out of the window)
//! - otherwise: step fine
//!
//! Both `Coarse` and `Fine` use the same predicate, so crossing back out of the window
//! returns to coarse stepping on the very next step. Step sizes carry the sign of the
//! sweep direction. Requested values are quantized to 1 nV and snapped to exactly zero
//! within 1 uV so long sweeps do not accumulate binary drift. A step that leaves the
//! requested value unchanged is an `InvalidConfig` error rather than a silent repeat.
//!
//! # Failures
//!
//! A failed write or read still consumes the step: the step number and the sweep
//! position advance, a sample with `response: None` goes to the sink, and the error is
//! returned. The session stays steppable; whether to continue is the caller's decision.

use crate::error::{SweepError, SweepResult};
use crate::hardware::capabilities::{MeterDriver, SourceDriver, SourceSetting};
use crate::hardware::gpib::DeviceAddress;
use crate::sink::SampleSink;
use crate::sweep::config::{
    MeasureFunction, OperatingMode, SweepConfiguration, SweepDirection, MIN_STEP,
};
use crate::sweep::state::{Sample, StepMode, SweepState};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay between commanding a stimulus and reading the meter.
pub const SETTLE_TIME: Duration = Duration::from_millis(250);

/// Requested values closer to zero than this are snapped to 0.0.
const ZERO_SNAP: f64 = MIN_STEP;

/// Quantization of requested values (1 nV).
const QUANTA_PER_VOLT: f64 = 1.0e9;

/// Upper bound on planned steps, guards against degenerate configurations.
const MAX_PLANNED_STEPS: usize = 1_000_000;

/// Sweep session: configuration, live state and the two instrument drivers.
pub struct SweepController {
    source: Box<dyn SourceDriver>,
    meter: Box<dyn MeterDriver>,
    config: SweepConfiguration,
    state: SweepState,
}

impl SweepController {
    /// Create a controller positioned at the start of the sweep.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration fails validation.
    pub fn new(
        source: Box<dyn SourceDriver>,
        meter: Box<dyn MeterDriver>,
        config: SweepConfiguration,
    ) -> SweepResult<Self> {
        config.validate()?;
        let state = SweepState::new(config.start);
        Ok(Self {
            source,
            meter,
            config,
            state,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &SweepConfiguration {
        &self.config
    }

    /// Live sweep state.
    pub fn state(&self) -> &SweepState {
        &self.state
    }

    /// Bus address of the source.
    pub fn source_address(&self) -> DeviceAddress {
        self.source.address()
    }

    /// Bus address of the meter.
    pub fn meter_address(&self) -> DeviceAddress {
        self.meter.address()
    }

    /// Whether both device handles are open.
    pub fn devices_open(&self) -> bool {
        self.source.is_open() && self.meter.is_open()
    }

    /// Replace the configuration between runs and reset.
    ///
    /// # Errors
    /// `InvalidConfig`; the previous configuration stays active.
    pub fn reconfigure(&mut self, config: SweepConfiguration) -> SweepResult<()> {
        config.validate()?;
        self.config = config;
        self.reset();
        Ok(())
    }

    /// Restart the sweep without touching the instruments.
    pub fn reset(&mut self) {
        self.state = SweepState::new(self.config.start);
        debug!(start = self.config.start, "sweep reset");
    }

    /// Configure both instruments for a run.
    ///
    /// Returns `false` if either device is not open or refuses its configuration.
    /// Repeating the call issues the same configuration again.
    pub async fn setup(&mut self, function: MeasureFunction) -> bool {
        if !self.devices_open() {
            error!(
                source = %self.source.address(),
                meter = %self.meter.address(),
                "setup failure: units are not open"
            );
            return false;
        }

        info!(function = ?function, "setting up to run sweep");
        if let Err(e) = self.meter.configure(&function).await {
            error!(error = %e, "setup failure: meter configuration rejected");
            return false;
        }

        let setting = SourceSetting {
            current_limit: self.config.current_limit,
        };
        if let Err(e) = self.source.configure(&setting).await {
            error!(error = %e, "setup failure: source configuration rejected");
            return false;
        }

        info!(
            start = self.config.start,
            stop = self.config.stop,
            step = self.config.coarse_step,
            fine = self.config.fine_step,
            window = self.config.window,
            "sweep configured"
        );
        true
    }

    /// Configure the instruments for the configured operating mode.
    pub async fn setup_for_mode(&mut self) -> bool {
        let function = self.config.mode.measure_function();
        self.setup(function).await
    }

    /// Apply the requested stimulus, measure, emit the sample and advance.
    ///
    /// # Errors
    /// - `NotConnected` if either device is closed; state is unchanged
    /// - `WriteFailed` / `ReadFailed` if the step failed; the step is still consumed
    /// - `Sink` if the sink refused the sample; the step is still consumed
    /// - `InvalidConfig` if the next step would not move the requested value
    pub async fn step_and_acquire(&mut self, sink: &mut dyn SampleSink) -> SweepResult<Sample> {
        if let Some(address) = self.first_closed_device() {
            warn!(%address, "step refused: device not connected");
            return Err(SweepError::NotConnected { address });
        }

        self.state.step_number += 1;
        let step = self.state.step_number;
        let stimulus = self.state.requested_value;

        let outcome = self.apply_and_measure(stimulus).await;
        let response = outcome.as_ref().ok().copied();
        if response.is_some() {
            self.state.last_measurement = response;
        }

        let sample = Sample {
            stimulus,
            response,
            step_index: step,
        };
        let delivered = sink.accept(sample);
        if let Err(stalled) = self.advance() {
            error!(step, stimulus, error = %stalled, "sweep cannot advance");
            return Err(stalled);
        }

        match outcome {
            Ok(value) => {
                debug!(step, stimulus, response = value, mode = %self.state.step_mode, "step taken");
                delivered.map_err(|e| SweepError::Sink(e.to_string()))?;
                Ok(sample)
            }
            Err(e) => {
                warn!(step, stimulus, error = %e, "step failed");
                if let Err(sink_error) = delivered {
                    error!(step, error = %sink_error, "sink refused failed sample");
                }
                Err(e)
            }
        }
    }

    /// Whether a stimulus beyond `stop` has been applied.
    ///
    /// Pure; may be polled at any time.
    pub fn done(&self) -> bool {
        match self.state.last_applied_value {
            None => false,
            Some(applied) => past_stop(&self.config, applied),
        }
    }

    /// Probe both instruments. A device that fails stays absent for the session.
    pub async fn check_health(&mut self) -> bool {
        let source_ok = self.source.check_health().await;
        let meter_ok = self.meter.check_health().await;
        if !(source_ok && meter_ok) {
            warn!(source_ok, meter_ok, "instrument health check failed");
        }
        source_ok && meter_ok
    }

    /// Put the source output in standby.
    pub async fn standby(&mut self) -> SweepResult<()> {
        self.source.standby().await
    }

    /// Number of steps a fault-free run of the current configuration takes.
    pub fn estimated_steps(&self) -> usize {
        plan_stimuli(&self.config).len()
    }

    fn first_closed_device(&self) -> Option<DeviceAddress> {
        if !self.source.is_open() {
            Some(self.source.address())
        } else if !self.meter.is_open() {
            Some(self.meter.address())
        } else {
            None
        }
    }

    async fn apply_and_measure(&mut self, stimulus: f64) -> SweepResult<f64> {
        self.source.set_stimulus(stimulus).await?;
        self.state.last_applied_value = Some(stimulus);

        tokio::time::sleep(SETTLE_TIME).await;

        let reading = self.meter.read_measurement().await?;
        Ok(self.scale_reading(reading))
    }

    fn scale_reading(&self, reading: f64) -> f64 {
        match self.config.mode {
            OperatingMode::InferredCurrent => reading / self.config.sense_resistance,
            _ => reading,
        }
    }

    fn advance(&mut self) -> SweepResult<()> {
        let (next, mode) = next_request(&self.config, self.state.requested_value)?;
        if mode != self.state.step_mode {
            info!(
                step = self.state.step_number,
                from = %self.state.step_mode,
                to = %mode,
                at = self.state.requested_value,
                "step mode changed"
            );
        }
        self.state.requested_value = next;
        self.state.step_mode = mode;
        Ok(())
    }
}

/// Next requested value and the step mode used to reach it.
///
/// # Errors
/// `InvalidConfig` if the step rounds away and the value would not move.
pub fn next_request(config: &SweepConfiguration, requested: f64) -> SweepResult<(f64, StepMode)> {
    let landing = normalize(requested + config.signed_coarse_step());
    let mode = if landing.abs() >= config.window {
        StepMode::Coarse
    } else {
        StepMode::Fine
    };
    let next = match mode {
        StepMode::Coarse => landing,
        StepMode::Fine => normalize(requested + config.signed_fine_step()),
    };
    if next == requested {
        return Err(SweepError::InvalidConfig(format!(
            "{} step from {} does not move the sweep",
            mode, requested
        )));
    }
    Ok((next, mode))
}

/// Stimulus sequence of a fault-free run, without touching hardware.
///
/// Ends early at a step that cannot move the sweep.
pub fn plan_stimuli(config: &SweepConfiguration) -> Vec<f64> {
    let mut stimuli = Vec::new();
    let mut requested = config.start;
    loop {
        stimuli.push(requested);
        if past_stop(config, requested) || stimuli.len() >= MAX_PLANNED_STEPS {
            break;
        }
        match next_request(config, requested) {
            Ok((next, _)) => requested = next,
            Err(_) => break,
        }
    }
    stimuli
}

fn past_stop(config: &SweepConfiguration, applied: f64) -> bool {
    match config.direction() {
        SweepDirection::Ascending => applied > config.stop,
        SweepDirection::Descending => applied < config.stop,
    }
}

fn normalize(value: f64) -> f64 {
    let quantized = (value * QUANTA_PER_VOLT).round() / QUANTA_PER_VOLT;
    if quantized.abs() < ZERO_SNAP {
        0.0
    } else {
        quantized
    }
}
